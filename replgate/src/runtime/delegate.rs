//! The delegate collaborator and the nested scope it runs in.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error};

use crate::core::types::ExecutionResult;
use crate::lang::{Namespace, Value};
use crate::runtime::interpreter::{ExecutionLimits, elapsed_ms, execute_in, seeded_namespace};
use crate::runtime::router::OutputRouter;

/// One `llm_query(chunk, question)` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateRequest {
    pub chunk: String,
    pub question: String,
    /// Router depth the delegate runs at (1 for calls made by top-level code).
    pub depth: usize,
}

/// External reasoning component answering questions about a chunk.
///
/// Implementations may run their own code units through the scope; their
/// output is captured at the scope's depth and never reaches the caller's
/// stdout. Errors and panics become an error-marker string for the calling
/// code, they are never raised into it.
pub trait Delegate: Send + Sync {
    fn query(&self, request: &DelegateRequest, scope: &mut DelegateScope<'_>) -> Result<String>;
}

/// Router depth held open for the duration of one delegate call.
///
/// Dropping the scope pops the depth, including during panic unwinding.
pub struct DelegateScope<'r> {
    router: &'r mut OutputRouter,
    delegate: Option<Arc<dyn Delegate>>,
    limits: ExecutionLimits,
    namespace: Namespace,
    depth: usize,
}

impl<'r> DelegateScope<'r> {
    pub(crate) fn enter(
        router: &'r mut OutputRouter,
        delegate: Option<Arc<dyn Delegate>>,
        limits: ExecutionLimits,
        request: &DelegateRequest,
    ) -> Self {
        let depth = router.enter();
        let mut namespace = seeded_namespace();
        namespace.insert("context".to_string(), Value::Str(request.chunk.clone()));
        namespace.insert("question".to_string(), Value::Str(request.question.clone()));
        debug!(depth, "delegate scope entered");
        Self {
            router,
            delegate,
            limits,
            namespace,
            depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Run a code unit at this scope's depth against the scope's own
    /// namespace (seeded with `context` and `question`).
    pub fn execute(&mut self, code: &str) -> ExecutionResult {
        let started = Instant::now();
        let start = self.router.current().len();
        let (error, diff) = execute_in(
            code,
            &mut self.namespace,
            self.router,
            self.delegate.clone(),
            self.limits,
        );
        let stdout = self.router.current().get(start..).unwrap_or_default().to_string();
        ExecutionResult {
            stdout,
            error,
            diff,
            duration_ms: elapsed_ms(started),
        }
    }

    /// Everything written at this depth so far.
    pub fn output(&self) -> &str {
        self.router.current()
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }
}

impl Drop for DelegateScope<'_> {
    fn drop(&mut self) {
        match self.router.leave() {
            Ok(captured) => debug!(depth = self.depth, captured = captured.len(), "delegate scope left"),
            Err(err) => error!(depth = self.depth, %err, "delegate scope could not leave router depth"),
        }
    }
}
