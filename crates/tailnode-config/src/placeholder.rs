//! `{namespace.key}` placeholder expansion
//!
//! Only the `env` namespace is built in. Undefined or empty values are errors
//! rather than silent empty strings; a literal brace is written `\{` or `\}`.

use crate::env::EnvSource;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("unterminated placeholder at offset {position}")]
    Unterminated { position: usize },

    #[error("malformed placeholder {text:?} at offset {position}")]
    Malformed { text: String, position: usize },

    #[error("unknown placeholder {{{0}}}")]
    Unknown(String),

    #[error("environment variable {0} is not set")]
    Undefined(String),

    #[error("environment variable {0} is empty")]
    Empty(String),
}

/// Answers placeholder keys such as `env.HOME`
pub trait Placeholders {
    fn lookup(&self, key: &str) -> Result<String, ExpandError>;
}

/// Resolves `{env.NAME}` from an [`EnvSource`]
pub struct EnvPlaceholders<'a> {
    env: &'a dyn EnvSource,
}

impl<'a> EnvPlaceholders<'a> {
    pub fn new(env: &'a dyn EnvSource) -> Self {
        Self { env }
    }
}

impl Placeholders for EnvPlaceholders<'_> {
    fn lookup(&self, key: &str) -> Result<String, ExpandError> {
        let Some(name) = key.strip_prefix("env.") else {
            return Err(ExpandError::Unknown(key.to_string()));
        };
        match self.env.var(name) {
            None => Err(ExpandError::Undefined(name.to_string())),
            Some(value) if value.is_empty() => Err(ExpandError::Empty(name.to_string())),
            Some(value) => Ok(value),
        }
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Replace every placeholder in `template`.
///
/// Fails on the first placeholder that cannot be resolved. Text without
/// placeholders is returned unchanged.
pub fn expand(template: &str, placeholders: &dyn Placeholders) -> Result<String, ExpandError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(idx) = rest.find(['{', '\\']) {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        let position = template.len() - tail.len();

        if let Some(after) = tail.strip_prefix('\\') {
            match after.chars().next() {
                Some(c @ ('{' | '}')) => {
                    out.push(c);
                    rest = &after[1..];
                }
                _ => {
                    out.push('\\');
                    rest = after;
                }
            }
            continue;
        }

        let close = tail
            .find('}')
            .ok_or(ExpandError::Unterminated { position })?;
        let key = &tail[1..close];
        if key.is_empty() || !key.chars().all(is_key_char) {
            return Err(ExpandError::Malformed {
                text: tail[..=close].to_string(),
                position,
            });
        }

        out.push_str(&placeholders.lookup(key)?);
        rest = &tail[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
