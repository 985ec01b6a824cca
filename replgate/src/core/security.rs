//! Static policy evaluation of submitted code units.
//!
//! The gate is a pure function of `(code, level)`: it holds no state, performs
//! no I/O and never executes anything. `BASIC` scans the unit against a fixed
//! catalogue of banned capability patterns; `STRICT` only checks that the
//! unit parses and leaves the decision to an explicit reviewer.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{SecurityLevel, SecurityVerdict};
use crate::lang;

/// Pluggable policy seam. The controller only talks to this trait.
pub trait SecurityGate: Send + Sync {
    fn evaluate(&self, code: &str, level: SecurityLevel) -> SecurityVerdict;
}

/// Default gate backed by [`banned_patterns`] and the cell-language parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternGate;

impl SecurityGate for PatternGate {
    fn evaluate(&self, code: &str, level: SecurityLevel) -> SecurityVerdict {
        evaluate(code, level)
    }
}

/// A banned capability pattern.
#[derive(Debug)]
pub struct BannedPattern {
    pub id: &'static str,
    pub description: &'static str,
    regex: Regex,
}

impl BannedPattern {
    pub fn is_match(&self, code: &str) -> bool {
        self.regex.is_match(code)
    }
}

const CATALOGUE: &[(&str, &str, &str)] = &[
    (
        "process.spawn",
        "process/system invocation blocked",
        r"(?i)\b(os\.system|system|subprocess|popen|spawn|shell|exec)\b",
    ),
    (
        "fs.absolute_path",
        "absolute filesystem path blocked",
        r#"(?i)["'](/|~|[a-z]:[\\/])"#,
    ),
    (
        "fs.escape",
        "file access outside the sandbox blocked",
        r"(?i)\b(open|read_file|write_file)\s*\(|\.\./",
    ),
    (
        "net.access",
        "network access blocked",
        r"(?i)\b(socket|urlopen|connect)\b|https?://|\brequests\.",
    ),
    (
        "reflect.internals",
        "interpreter internals access blocked",
        r"(?i)__\w+__|\b(globals|locals|eval|compile|importlib|ctypes)\b",
    ),
    (
        "import.dangerous",
        "dangerous module import blocked",
        r"(?im)^\s*(import|from)\s+(os|sys|subprocess|shutil|socket)\b",
    ),
];

static PATTERNS: LazyLock<Vec<BannedPattern>> = LazyLock::new(|| {
    CATALOGUE
        .iter()
        .map(|(id, description, pattern)| BannedPattern {
            id,
            description,
            regex: Regex::new(pattern).expect("catalogue pattern compiles"),
        })
        .collect()
});

/// The fixed catalogue, in evaluation order.
pub fn banned_patterns() -> &'static [BannedPattern] {
    &PATTERNS
}

/// Every catalogue pattern matched by `code`.
pub fn scan(code: &str) -> Vec<&'static BannedPattern> {
    banned_patterns()
        .iter()
        .filter(|pattern| pattern.is_match(code))
        .collect()
}

pub fn evaluate(code: &str, level: SecurityLevel) -> SecurityVerdict {
    match level {
        SecurityLevel::None => SecurityVerdict::approve("security checks disabled"),
        SecurityLevel::Basic => {
            let matched = scan(code);
            if matched.is_empty() {
                return SecurityVerdict::approve("no banned patterns matched");
            }
            let reasons = matched
                .iter()
                .map(|p| format!("{} (matched {})", p.description, p.id))
                .collect();
            let ids = matched.iter().map(|p| p.id.to_string()).collect();
            SecurityVerdict::reject(reasons, ids)
        }
        SecurityLevel::Strict => match lang::parse_program(code) {
            Ok(_) => SecurityVerdict::defer("well-formed; awaiting explicit review"),
            Err(message) => SecurityVerdict::reject(vec![format!("malformed: {message}")], Vec::new()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Decision;

    fn matched_ids(code: &str) -> Vec<&'static str> {
        scan(code).iter().map(|p| p.id).collect()
    }

    #[test]
    fn none_approves_everything() {
        let verdict = evaluate("import os; os.system('rm -rf /')", SecurityLevel::None);
        assert_eq!(verdict.decision, Decision::Approve);
    }

    #[test]
    fn basic_rejects_bare_shell_words() {
        let verdict = evaluate("run system shell command", SecurityLevel::Basic);
        assert_eq!(verdict.decision, Decision::Reject);
        assert_eq!(verdict.matched_patterns, vec!["process.spawn"]);
        assert_eq!(
            verdict.reasons,
            vec!["process/system invocation blocked (matched process.spawn)"]
        );
    }

    #[test]
    fn basic_names_every_matched_pattern() {
        let code = "import os\ndata = open(\"/etc/passwd\")\nurl = 'https://example.com'";
        assert_eq!(
            matched_ids(code),
            vec!["fs.absolute_path", "fs.escape", "net.access", "import.dangerous"]
        );
    }

    #[test]
    fn basic_matching_is_case_insensitive() {
        assert_eq!(matched_ids("x = SubProcess"), vec!["process.spawn"]);
        assert_eq!(matched_ids("y = __Builtins__"), vec!["reflect.internals"]);
    }

    #[test]
    fn basic_approves_clean_code() {
        let code = "total = sum(range(10))\nfor w in split(\"a b\") { print(upper(w)) }";
        let verdict = evaluate(code, SecurityLevel::Basic);
        assert_eq!(verdict.decision, Decision::Approve);
        assert!(verdict.matched_patterns.is_empty());
    }

    #[test]
    fn word_boundaries_avoid_false_positives() {
        assert!(matched_ids("systematic = 1; reshell = 2; opener = 3").is_empty());
        assert!(matched_ids("ratio = 1 / 2").is_empty());
    }

    #[test]
    fn strict_defers_well_formed_code() {
        let verdict = evaluate("x = 1 + 1", SecurityLevel::Strict);
        assert_eq!(verdict.decision, Decision::Defer);
    }

    #[test]
    fn strict_rejects_malformed_code() {
        let verdict = evaluate("x = (1 +", SecurityLevel::Strict);
        assert_eq!(verdict.decision, Decision::Reject);
        assert!(verdict.reasons[0].starts_with("malformed"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let code = "print(eval(\"1\"))";
        assert_eq!(
            evaluate(code, SecurityLevel::Basic),
            evaluate(code, SecurityLevel::Basic)
        );
    }
}
