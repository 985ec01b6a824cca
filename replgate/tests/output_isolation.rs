//! Delegate calls made from session code: nested output stays at its depth
//! and failures come back as marker strings.

use std::sync::Arc;

use replgate::core::types::SecurityLevel;
use replgate::runtime::DELEGATE_ERROR_PREFIX;
use replgate::test_support::{FailingDelegate, ScriptedDelegate, config, shared};
use replgate::{ReplTools, SessionOptions, ToolStatus};

const SESSION: &str = "delegating";

fn tools_with(delegate: Arc<dyn replgate::runtime::Delegate>) -> ReplTools {
    let tools = ReplTools::new(config(SecurityLevel::None, 5)).with_delegate(delegate);
    tools
        .open_session(SESSION, SessionOptions::default())
        .expect("open session");
    tools
}

#[test]
fn nested_prints_never_reach_top_level_stdout() {
    let (delegate, erased) = shared(ScriptedDelegate::running(
        "print('inner sees', len(context))\nnote = upper(question)",
        "summary",
    ));
    let tools = tools_with(erased);

    let response = tools
        .execute_code(
            SESSION,
            "print('before')\nanswer = llm_query('abcdef', 'what is it')\nprint('after')",
        )
        .expect("execute_code");

    assert_eq!(response.status, ToolStatus::Success);
    assert_eq!(response.stdout, "before\nafter\n");
    assert_eq!(response.variables, vec!["answer"]);

    let calls = delegate.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].request.depth, 1);
    assert_eq!(calls[0].request.chunk, "abcdef");
    assert_eq!(calls[0].captured, "inner sees 6\n");
    let nested = calls[0].nested.as_ref().expect("nested unit ran");
    assert_eq!(nested.stdout, "inner sees 6\n");
    assert_eq!(nested.diff.added, vec!["note"]);

    let record = tools.session_record(SESSION).expect("record");
    assert_eq!(
        record.namespace.get("answer"),
        Some(&serde_json::json!("summary (about: what is it)"))
    );
    assert!(!record.namespace.contains_key("note"));
}

#[test]
fn each_call_gets_a_fresh_buffer() {
    let (delegate, erased) = shared(ScriptedDelegate::running("print(question)", "ok"));
    let tools = tools_with(erased);

    tools
        .execute_code(SESSION, "for q in ['one', 'two'] { llm_query('c', q) }")
        .expect("execute_code");

    let captured: Vec<String> = delegate.calls().into_iter().map(|c| c.captured).collect();
    assert_eq!(captured, vec!["one\n", "two\n"]);
}

#[test]
fn delegate_failure_is_a_marker_not_a_fault() {
    let tools = tools_with(Arc::new(FailingDelegate));

    let response = tools
        .execute_code(SESSION, "r = llm_query('chunk', 'question')\nprint(r)")
        .expect("execute_code");

    assert_eq!(response.status, ToolStatus::Success);
    assert_eq!(
        response.stdout,
        format!("{DELEGATE_ERROR_PREFIX}upstream unavailable\n")
    );
    assert_eq!(response.iteration, 1);
}

#[test]
fn sessions_do_not_share_namespaces() {
    let tools = ReplTools::new(config(SecurityLevel::None, 5));
    tools.open_session("a", SessionOptions::default()).expect("open a");
    tools.open_session("b", SessionOptions::default()).expect("open b");

    tools.execute_code("a", "x = 'from a'").expect("a");
    let response = tools.execute_code("b", "print(x)").expect("b");

    assert_eq!(response.status, ToolStatus::Error);
    assert!(response.stdout.is_empty());
    assert_eq!(tools.session_ids(), vec!["a", "b"]);
}

#[test]
fn sessions_run_in_parallel_threads() {
    let tools = Arc::new(ReplTools::new(config(SecurityLevel::Basic, 50)));
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let tools = Arc::clone(&tools);
            std::thread::spawn(move || {
                let id = format!("worker-{n}");
                tools.open_session(&id, SessionOptions::default()).expect("open");
                for i in 0..10 {
                    let response = tools
                        .execute_code(&id, &format!("total = {i} * {n}"))
                        .expect("execute_code");
                    assert_eq!(response.status, ToolStatus::Success);
                }
                tools.get_repl_state(&id).expect("state").iteration
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().expect("worker thread"), 10);
    }
}
