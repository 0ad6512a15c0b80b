//! Hierarchical path validation (spec.md GLOSSARY: "Hierarchical path").
//!
//! A path is a dotted sequence of label tokens, each matching
//! `[A-Za-z_][A-Za-z0-9_]*`. Validation happens before any transaction opens,
//! per the `InvalidInput` policy in spec.md §7.

use crate::error::{Error, Result};

fn is_token_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_token_rest(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_valid_token(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if is_token_start(c) => {}
        _ => return false,
    }
    chars.all(is_token_rest)
}

/// Validates a hierarchical path (`a.b.c`). Rejects the empty path and any
/// component that does not match the token grammar.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::invalid_input("path must not be empty"));
    }
    for token in path.split('.') {
        if !is_valid_token(token) {
            return Err(Error::invalid_input(format!(
                "invalid path token {token:?} in path {path:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_paths() {
        assert!(validate_path("kb1.h.n.KB_JOB_QUEUE.j").is_ok());
        assert!(validate_path("_a.b1.c_2").is_ok());
        assert!(validate_path("single").is_ok());
    }

    #[test]
    fn rejects_empty_path() {
        assert!(validate_path("").is_err());
    }

    #[test]
    fn rejects_empty_token() {
        assert!(validate_path("a..b").is_err());
        assert!(validate_path(".a").is_err());
        assert!(validate_path("a.").is_err());
    }

    #[test]
    fn rejects_tokens_starting_with_digit() {
        assert!(validate_path("a.1b.c").is_err());
    }

    #[test]
    fn rejects_tokens_with_illegal_characters() {
        assert!(validate_path("a.b-c").is_err());
        assert!(validate_path("a.b c").is_err());
    }
}
