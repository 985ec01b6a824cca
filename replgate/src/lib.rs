//! Security-gated REPL state machine.
//!
//! An orchestrating process submits code units; each unit passes a security
//! gate, runs against a persistent per-session namespace and counts against
//! an iteration budget. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (states, transitions, policy,
//!   invariants). No I/O, fully testable in isolation.
//! - **[`lang`]** and **[`runtime`]**: the sandboxed cell language and the
//!   interpreter that runs it, with depth-isolated output for delegate calls.
//! - **[`io`]**: Side-effecting collaborators (config, archive, artifacts,
//!   audit).
//!
//! [`controller`] drives the protocol for one session; [`tools`] exposes it
//! to orchestrators across many sessions.

pub mod controller;
pub mod core;
pub mod error;
pub mod io;
pub mod lang;
pub mod logging;
pub mod runtime;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;

pub use crate::controller::{Controller, Review};
pub use crate::core::transcript::{check_for_final_answer, find_code_blocks};
pub use crate::error::GateError;
pub use crate::tools::{ReplTools, SessionOptions, ToolStatus};
