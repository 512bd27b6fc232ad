//! String Escaping Helpers
//!
//! Quoting for the two places text crosses into another interpreter: shell
//! words (logged command lines, `sh -c` bodies, lock keys) and SQL literals or
//! identifiers.

/// Characters that never need quoting in a POSIX shell word
fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
}

/// Quote a string as a single POSIX shell word
///
/// Safe strings are returned unchanged. Anything else is wrapped in single
/// quotes, with embedded single quotes written as `'\''`.
///
/// # Example
///
/// ```
/// use nas_rc::escape::shell_quote;
///
/// assert_eq!(shell_quote("plain"), "plain");
/// assert_eq!(shell_quote("it's"), "'it'\\''s'");
/// ```
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_shell_safe) {
        return s.to_string();
    }

    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Join an argv into the canonical command line string
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a SQL string literal
pub fn sql_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Error returned for identifiers SQLite cannot represent
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("SQL identifier contains a NUL byte: {0:?}")]
pub struct InvalidIdentifier(pub String);

/// Render a SQL identifier (table or column name)
pub fn quote_ident(s: &str) -> Result<String, InvalidIdentifier> {
    if s.contains('\0') {
        return Err(InvalidIdentifier(s.to_string()));
    }
    Ok(format!("\"{}\"", s.replace('"', "\"\"")))
}
