//! Completion heuristics: deciding when a command's response has ended.
//!
//! The external tool has no framing of its own, so a session keeps reading
//! stdout until a line satisfies a [`CompletionHeuristic`]. The default
//! [`MarkerHeuristic`] recognises a closing code fence at the end of a line
//! or a literal done-marker anywhere in it. Any `Fn(&str) -> bool` closure
//! can stand in for it.

use regex::Regex;

use crate::config::SessionConfig;
use crate::{AppError, Result};

/// Predicate over a single non-empty output line.
pub trait CompletionHeuristic: Send + Sync {
    /// Return `true` when `line` ends the current response.
    fn is_complete(&self, line: &str) -> bool;
}

impl<F> CompletionHeuristic for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_complete(&self, line: &str) -> bool {
        self(line)
    }
}

/// Marker-based heuristic configured from `[session]`.
#[derive(Debug, Clone)]
pub struct MarkerHeuristic {
    suffixes: Vec<String>,
    tokens: Vec<String>,
    pattern: Option<Regex>,
}

impl MarkerHeuristic {
    /// Build a heuristic from explicit markers.
    #[must_use]
    pub fn new(suffixes: Vec<String>, tokens: Vec<String>, pattern: Option<Regex>) -> Self {
        Self {
            suffixes,
            tokens,
            pattern,
        }
    }

    /// Build the heuristic described by a session configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `completion_pattern` is not a valid regex.
    pub fn from_config(session: &SessionConfig) -> Result<Self> {
        let pattern = session
            .completion_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|err| AppError::Config(format!("invalid completion pattern: {err}")))?;

        Ok(Self::new(
            session.completion_suffixes.clone(),
            session.completion_tokens.clone(),
            pattern,
        ))
    }
}

impl Default for MarkerHeuristic {
    fn default() -> Self {
        Self::new(vec!["```".into()], vec!["[DONE]".into()], None)
    }
}

impl CompletionHeuristic for MarkerHeuristic {
    fn is_complete(&self, line: &str) -> bool {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return false;
        }

        self.suffixes
            .iter()
            .any(|suffix| !suffix.is_empty() && trimmed.ends_with(suffix.as_str()))
            || self
                .tokens
                .iter()
                .any(|token| !token.is_empty() && trimmed.contains(token.as_str()))
            || self
                .pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(trimmed))
    }
}
