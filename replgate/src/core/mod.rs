//! Deterministic, pure logic shared by the gate.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! session state and return deterministic outputs suitable for tests.

pub mod budget;
pub mod invariants;
pub mod security;
pub mod session;
pub mod transitions;
pub mod transcript;
pub mod types;
