//! Helpers for orchestrators reading model output.

use std::sync::LazyLock;

use regex::Regex;

static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:repl|python)[ \t]*\r?\n(.*?)\r?\n```").expect("code block regex")
});

static FINAL_ANSWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)FINAL\((.*?)\)").expect("final answer regex"));

/// Bodies of every ```` ```repl ```` or ```` ```python ```` fenced block, in
/// order of appearance.
pub fn find_code_blocks(text: &str) -> Vec<String> {
    CODE_BLOCK
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|body| body.as_str().to_string())
        .collect()
}

/// Trimmed argument of the first `FINAL(...)` marker.
pub fn check_for_final_answer(text: &str) -> Option<String> {
    FINAL_ANSWER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|answer| answer.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_blocks_in_order() {
        let text = "thinking\n```repl\nx = 1\n```\nmore\n```python\nprint(x)\ny = 2\n```\n```rust\nfn main() {}\n```";
        assert_eq!(find_code_blocks(text), vec!["x = 1", "print(x)\ny = 2"]);
    }

    #[test]
    fn no_blocks_in_plain_text() {
        assert!(find_code_blocks("just prose").is_empty());
    }

    #[test]
    fn final_marker_is_trimmed() {
        assert_eq!(check_for_final_answer("done. FINAL( 42 )").as_deref(), Some("42"));
        assert_eq!(check_for_final_answer("FINAL_VAR(x)"), None);
        assert_eq!(check_for_final_answer("not yet"), None);
    }
}
