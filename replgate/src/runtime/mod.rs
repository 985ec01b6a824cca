//! Sandboxed execution: interpreter, delegate scopes and output routing.

pub mod delegate;
pub mod interpreter;
pub mod router;

pub use delegate::{Delegate, DelegateRequest, DelegateScope};
pub use interpreter::{DELEGATE_ERROR_PREFIX, ExecutionLimits, Interpreter};
pub use router::{OutputRouter, RouterError};
