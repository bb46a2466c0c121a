#![allow(clippy::module_name_repetitions)]
//! Small utilities: process execution, script builders, shell/batch escaping, secret masking.

pub mod exec;
pub mod shell_file;

pub use exec::{ExecContext, ExecError, ExecOutput, ExecRequest, ExecService, ProcessRunner};
pub use shell_file::ShellFile;

/// Reject strings containing newline, carriage return, or NUL before embedding into a script.
///
/// Keep error text stable (tests/UX depend on it).
pub fn reject_newlines(s: &str, what: &str) -> Result<(), String> {
    if s.contains('\n') || s.contains('\r') || s.contains('\0') {
        Err(format!("refusing to embed {what}: contains newline"))
    } else {
        Ok(())
    }
}

pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_=./:@".contains(c))
    {
        s.to_string()
    } else {
        let escaped = s.replace('\'', "'\"'\"'");
        format!("'{}'", escaped)
    }
}

/// Escape a value for an unquoted `echo` in a cmd.exe batch file.
pub fn batch_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '%' => out.push_str("%%"),
            '^' | '&' | '|' | '<' | '>' | '(' | ')' | '!' => {
                out.push('^');
                out.push(ch);
            }
            c => out.push(c),
        }
    }
    out
}

/// Mask a secret for logs, keeping only the first and last 4 characters.
/// Secrets too short to keep both ends are fully masked.
pub fn mask_secret(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape_simple() {
        assert_eq!(shell_escape("abc-123_./:@"), "abc-123_./:@");
    }

    #[test]
    fn test_shell_escape_with_spaces_and_quotes() {
        assert_eq!(shell_escape("a b c"), "'a b c'");
        assert_eq!(shell_escape("O'Reilly"), "'O'\"'\"'Reilly'");
    }

    #[test]
    fn test_batch_escape_metacharacters() {
        assert_eq!(batch_escape("plain_token-123"), "plain_token-123");
        assert_eq!(batch_escape("a&b|c"), "a^&b^|c");
        assert_eq!(batch_escape("100%"), "100%%");
        assert_eq!(batch_escape("<x>"), "^<x^>");
    }

    #[test]
    fn test_reject_newlines() {
        assert!(reject_newlines("ghp_abc", "token").is_ok());
        assert_eq!(
            reject_newlines("a\nb", "token").unwrap_err(),
            "refusing to embed token: contains newline"
        );
        assert!(reject_newlines("a\0b", "token").is_err());
    }

    #[test]
    fn test_mask_secret_keeps_ends() {
        assert_eq!(mask_secret("ghp_1234567890abcd"), "ghp_****abcd");
    }

    #[test]
    fn test_mask_secret_short_values_fully_hidden() {
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("abcdefgh"), "********");
        assert!(!mask_secret("abcdefgh").contains('a'));
    }
}
