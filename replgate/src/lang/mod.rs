//! The cell language executed by the interpreter.
//!
//! A deliberately small language: no imports, no attribute access, no file or
//! process primitives. The only way out of the sandbox is a capability value
//! bound into the namespace by the host.

pub mod ast;
mod builtins;
pub mod eval;
pub mod parser;
pub mod value;

pub use eval::{Host, run_program};
pub use parser::parse_program;
pub use value::{Capability, Namespace, Value};

/// Deepest nesting a code unit may use, in source and in the list values it
/// builds. Parsing, evaluation and rendering all recurse once per level.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Strip surrounding whitespace and quotes from a variable name.
pub fn clean_variable_name(raw: &str) -> &str {
    raw.trim().trim_matches(['"', '\'']).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_names_are_unquoted() {
        assert_eq!(clean_variable_name("  \"answer\" "), "answer");
        assert_eq!(clean_variable_name("'x'"), "x");
        assert_eq!(clean_variable_name("plain"), "plain");
    }
}
