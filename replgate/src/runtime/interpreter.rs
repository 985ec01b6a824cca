//! Persistent-namespace execution of approved code units.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::core::budget;
use crate::core::types::{ErrorKind, ExecutionResult, NamespaceDiff, RuntimeFault};
use crate::lang::{self, Capability, Host, Namespace, Value};
use crate::runtime::delegate::{Delegate, DelegateRequest, DelegateScope};
use crate::runtime::router::OutputRouter;

/// Prefix of every string `llm_query` returns instead of a finding.
pub const DELEGATE_ERROR_PREFIX: &str = "Error: delegate failed: ";

/// How often (in steps) the wall-clock deadline is consulted.
const DEADLINE_CHECK_INTERVAL: u64 = 64;

/// Cooperative limits applied to one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_steps: u64,
    pub deadline: Option<Instant>,
    pub max_delegate_depth: usize,
    /// Top-level stdout beyond this many bytes is truncated.
    pub output_limit_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            deadline: None,
            max_delegate_depth: 4,
            output_limit_bytes: 100_000,
        }
    }
}

/// Executes code units for one session.
///
/// The namespace persists across executions and is only ever extended:
/// runtime faults keep bindings made before the fault, while timeouts and
/// panics discard the whole execution's changes.
pub struct Interpreter {
    namespace: Namespace,
    router: OutputRouter,
    delegate: Option<Arc<dyn Delegate>>,
}

impl Interpreter {
    pub fn new(delegate: Option<Arc<dyn Delegate>>) -> Self {
        Self {
            namespace: seeded_namespace(),
            router: OutputRouter::new(),
            delegate,
        }
    }

    /// Bind `context` before the first execution. JSON strings bind as plain
    /// strings.
    pub fn with_context(mut self, context: &serde_json::Value) -> Self {
        self.namespace
            .insert("context".to_string(), Value::from_json(context));
        self
    }

    pub fn execute(&mut self, code: &str, limits: &ExecutionLimits) -> ExecutionResult {
        let started = Instant::now();
        self.router.reset();

        let delegate = self.delegate.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            execute_in(code, &mut self.namespace, &mut self.router, delegate, *limits)
        }));
        let (error, diff) = match outcome {
            Ok(result) => result,
            Err(_) => {
                error!("interpreter panicked; execution discarded");
                self.router.reset();
                (
                    Some(RuntimeFault::new(ErrorKind::Internal, "interpreter panicked")),
                    NamespaceDiff::default(),
                )
            }
        };

        let stdout = match self.router.take_root() {
            Ok(text) => text,
            Err(err) => {
                error!(%err, "router unbalanced after execution");
                self.router.reset();
                String::new()
            }
        };

        let result = ExecutionResult {
            stdout: truncate_output(stdout, limits.output_limit_bytes),
            error,
            diff,
            duration_ms: elapsed_ms(started),
        };
        debug!(
            stdout_len = result.stdout.len(),
            error = ?result.error.as_ref().map(|e| e.kind),
            added = result.diff.added.len(),
            changed = result.diff.changed.len(),
            "execution finished"
        );
        result
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }

    /// Sorted names of user-visible bindings (capabilities excluded).
    pub fn variable_names(&self) -> Vec<String> {
        self.namespace
            .iter()
            .filter(|(_, value)| !matches!(value, Value::Capability(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// JSON view of every binding, for the session snapshot.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.namespace
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }

    pub fn router_depth(&self) -> usize {
        self.router.depth()
    }
}

/// Namespace holding only the host capabilities.
pub(crate) fn seeded_namespace() -> Namespace {
    let mut namespace = Namespace::new();
    for cap in [Capability::DelegateQuery, Capability::FinalVar] {
        namespace.insert(cap.name().to_string(), Value::Capability(cap));
    }
    namespace
}

/// Parse and run `code` against a working copy of `namespace`, committing
/// the copy unless the run timed out.
pub(crate) fn execute_in(
    code: &str,
    namespace: &mut Namespace,
    router: &mut OutputRouter,
    delegate: Option<Arc<dyn Delegate>>,
    limits: ExecutionLimits,
) -> (Option<RuntimeFault>, NamespaceDiff) {
    let mut working = namespace.clone();
    let error = match lang::parse_program(code) {
        Err(message) => Some(RuntimeFault::new(ErrorKind::SyntaxError, message)),
        Ok(program) => {
            let mut host = SessionHost {
                router,
                delegate,
                limits,
                steps: 0,
            };
            lang::run_program(&program, &mut working, &mut host).err()
        }
    };

    if error.as_ref().is_some_and(|fault| fault.kind == ErrorKind::Timeout) {
        warn!("execution aborted; namespace changes discarded");
        return (error, NamespaceDiff::default());
    }
    let diff = diff_namespaces(namespace, &working);
    *namespace = working;
    (error, diff)
}

fn diff_namespaces(before: &Namespace, after: &Namespace) -> NamespaceDiff {
    let mut diff = NamespaceDiff::default();
    for (name, value) in after {
        match before.get(name) {
            None => diff.added.push(name.clone()),
            Some(previous) if previous != value => diff.changed.push(name.clone()),
            Some(_) => {}
        }
    }
    diff
}

/// Cut `text` at `limit` bytes (on a char boundary) and note what was dropped.
pub fn truncate_output(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = text[cut..].chars().count();
    format!("{}\n... [truncated, {omitted} chars omitted]", &text[..cut])
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// [`Host`] backed by the session router and delegate.
struct SessionHost<'r> {
    router: &'r mut OutputRouter,
    delegate: Option<Arc<dyn Delegate>>,
    limits: ExecutionLimits,
    steps: u64,
}

impl Host for SessionHost<'_> {
    fn write(&mut self, text: &str) {
        self.router.write(text);
    }

    fn tick(&mut self) -> Result<(), RuntimeFault> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(RuntimeFault::new(
                ErrorKind::Timeout,
                format!("step budget of {} exhausted", self.limits.max_steps),
            ));
        }
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 && budget::deadline_passed(self.limits.deadline) {
            return Err(RuntimeFault::new(ErrorKind::Timeout, "execution deadline exceeded"));
        }
        Ok(())
    }

    fn delegate(&mut self, chunk: String, question: String) -> String {
        let Some(delegate) = self.delegate.clone() else {
            return format!("{DELEGATE_ERROR_PREFIX}no delegate configured");
        };
        let depth = self.router.depth() + 1;
        if depth > self.limits.max_delegate_depth {
            warn!(depth, limit = self.limits.max_delegate_depth, "delegate depth limit reached");
            return format!(
                "{DELEGATE_ERROR_PREFIX}depth limit of {} reached",
                self.limits.max_delegate_depth
            );
        }

        let request = DelegateRequest {
            chunk,
            question,
            depth,
        };
        let mut scope = DelegateScope::enter(
            &mut *self.router,
            Some(Arc::clone(&delegate)),
            self.limits,
            &request,
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| delegate.query(&request, &mut scope)));
        drop(scope);

        match outcome {
            Ok(Ok(finding)) => finding,
            Ok(Err(err)) => {
                warn!(depth, error = %format!("{err:#}"), "delegate failed");
                format!("{DELEGATE_ERROR_PREFIX}{err:#}")
            }
            Err(_) => {
                error!(depth, "delegate panicked");
                format!("{DELEGATE_ERROR_PREFIX}delegate panicked")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;

    struct Echo;

    impl Delegate for Echo {
        fn query(&self, request: &DelegateRequest, scope: &mut DelegateScope<'_>) -> anyhow::Result<String> {
            let nested = scope.execute("print('inner', question)");
            Ok(format!("{}|{}", request.chunk, nested.stdout.trim_end()))
        }
    }

    struct Failing;

    impl Delegate for Failing {
        fn query(&self, _request: &DelegateRequest, _scope: &mut DelegateScope<'_>) -> anyhow::Result<String> {
            Err(anyhow!("backend unavailable"))
        }
    }

    struct Panicking;

    impl Delegate for Panicking {
        fn query(&self, _request: &DelegateRequest, scope: &mut DelegateScope<'_>) -> anyhow::Result<String> {
            scope.execute("print('before panic')");
            panic!("delegate blew up");
        }
    }

    /// Recurses through `llm_query` from inside its own scope.
    struct Recursive;

    impl Delegate for Recursive {
        fn query(&self, request: &DelegateRequest, scope: &mut DelegateScope<'_>) -> anyhow::Result<String> {
            let nested = scope.execute("r = llm_query(context, question)\nprint(r)");
            Ok(format!("d{}:{}", request.depth, nested.stdout.trim_end()))
        }
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits::default()
    }

    #[test]
    fn namespace_persists_across_executions() {
        let mut interp = Interpreter::new(None);
        let first = interp.execute("x = 40", &limits());
        assert_eq!(first.diff.added, vec!["x".to_string()]);
        let second = interp.execute("x = x + 2\nprint(x)", &limits());
        assert_eq!(second.stdout, "42\n");
        assert_eq!(second.diff.changed, vec!["x".to_string()]);
        assert_eq!(interp.lookup("x"), Some(&Value::Int(42)));
    }

    #[test]
    fn capabilities_are_seeded_but_not_listed() {
        let interp = Interpreter::new(None);
        assert!(matches!(interp.lookup("llm_query"), Some(Value::Capability(_))));
        assert!(interp.variable_names().is_empty());
        assert_eq!(
            interp.snapshot().get("llm_query"),
            Some(&serde_json::json!("<capability:llm_query>"))
        );
    }

    #[test]
    fn context_is_bound_from_json() {
        let interp = Interpreter::new(None).with_context(&serde_json::json!("some text"));
        assert_eq!(interp.lookup("context"), Some(&Value::Str("some text".to_string())));
    }

    #[test]
    fn syntax_errors_become_faults() {
        let mut interp = Interpreter::new(None);
        let result = interp.execute("x = (", &limits());
        assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::SyntaxError));
        assert!(interp.variable_names().is_empty());
    }

    #[test]
    fn timeout_discards_all_bindings() {
        let mut interp = Interpreter::new(None);
        let tight = ExecutionLimits {
            max_steps: 500,
            ..limits()
        };
        let result = interp.execute("a = 1\nfor i in range(10000) { b = i }", &tight);
        assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::Timeout));
        assert!(interp.lookup("a").is_none());
        assert!(interp.lookup("b").is_none());
    }

    #[test]
    fn expired_deadline_aborts() {
        let mut interp = Interpreter::new(None);
        let expired = ExecutionLimits {
            deadline: Some(Instant::now() - Duration::from_millis(1)),
            ..limits()
        };
        let result = interp.execute("for i in range(1000) { x = i }", &expired);
        assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::Timeout));
        assert!(interp.lookup("x").is_none());
    }

    #[test]
    fn delegate_output_stays_in_its_scope() {
        let mut interp = Interpreter::new(Some(Arc::new(Echo)));
        let result = interp.execute("print('top')\nr = llm_query('c1', 'q1')\nprint(r)", &limits());
        assert_eq!(result.error, None);
        assert_eq!(result.stdout, "top\nc1|inner q1\n");
        assert_eq!(interp.router_depth(), 0);
    }

    #[test]
    fn delegate_errors_become_markers() {
        let mut interp = Interpreter::new(Some(Arc::new(Failing)));
        let result = interp.execute("llm_query('q')", &limits());
        assert_eq!(result.stdout, "'Error: delegate failed: backend unavailable'\n");
    }

    #[test]
    fn delegate_panic_restores_depth() {
        let mut interp = Interpreter::new(Some(Arc::new(Panicking)));
        let result = interp.execute("r = llm_query('q')\nprint('after')", &limits());
        assert_eq!(result.error, None);
        assert_eq!(result.stdout, "after\n");
        assert_eq!(interp.router_depth(), 0);
        assert_eq!(
            interp.lookup("r"),
            Some(&Value::Str(format!("{DELEGATE_ERROR_PREFIX}delegate panicked")))
        );
    }

    #[test]
    fn recursion_stops_at_depth_limit() {
        let mut interp = Interpreter::new(Some(Arc::new(Recursive)));
        let capped = ExecutionLimits {
            max_delegate_depth: 2,
            ..limits()
        };
        let result = interp.execute("llm_query('c', 'q')", &capped);
        assert_eq!(
            result.stdout,
            "'d1:d2:Error: delegate failed: depth limit of 2 reached'\n"
        );
        assert_eq!(interp.router_depth(), 0);
    }

    #[test]
    fn missing_delegate_is_reported() {
        let mut interp = Interpreter::new(None);
        let result = interp.execute("print(llm_query('q'))", &limits());
        assert_eq!(result.stdout, "Error: delegate failed: no delegate configured\n");
    }

    #[test]
    fn long_output_is_truncated() {
        let mut interp = Interpreter::new(None);
        let small = ExecutionLimits {
            output_limit_bytes: 10,
            ..limits()
        };
        let result = interp.execute("print('abcdefghijklmnopqrst')", &small);
        assert_eq!(result.stdout, "abcdefghij\n... [truncated, 11 chars omitted]");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ééé".to_string();
        assert_eq!(truncate_output(text, 3), "é\n... [truncated, 2 chars omitted]");
    }
}
