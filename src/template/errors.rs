//! Template error types

use thiserror::Error;

/// Errors raised while parsing or rendering a config template
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Referenced variable is not in the render context
    #[error("undefined variable '{name}'{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    UndefinedVariable {
        name: String,
        suggestion: Option<String>,
    },

    /// Template could not be parsed
    #[error("syntax error at line {line}: {message}")]
    SyntaxError { message: String, line: usize },

    /// Any other rendering failure
    #[error("render failed: {0}")]
    Render(#[from] minijinja::Error),
}

impl TemplateError {
    /// Undefined variable error with a suggestion drawn from `known`
    pub fn undefined_variable(name: impl Into<String>, known: &[&str]) -> Self {
        let name = name.into();
        let suggestion = suggest_correction(&name, known);
        Self::UndefinedVariable { name, suggestion }
    }

    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::SyntaxError {
            message: message.into(),
            line,
        }
    }

    /// Convert a minijinja error, classifying parse and undefined failures
    pub(crate) fn from_minijinja(err: minijinja::Error, known: &[&str]) -> Self {
        match err.kind() {
            minijinja::ErrorKind::SyntaxError => {
                Self::syntax(err.to_string(), err.line().unwrap_or(0))
            }
            minijinja::ErrorKind::UndefinedError => {
                let name = quoted_name(&err.to_string()).unwrap_or_else(|| "unknown".into());
                Self::undefined_variable(name, known)
            }
            _ => Self::Render(err),
        }
    }
}

/// Pull the first backquoted identifier out of a minijinja message
fn quoted_name(msg: &str) -> Option<String> {
    let start = msg.find('`')? + 1;
    let end = msg[start..].find('`')?;
    Some(msg[start..start + end].to_string())
}

/// Suggest the closest candidate within a small edit distance
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    let max_distance = (typo.len() / 2).max(2);

    candidates
        .iter()
        .map(|c| (edit_distance(typo, c), *c))
        .filter(|(d, _)| *d <= max_distance)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.to_string())
}

/// Levenshtein distance over chars, single-row formulation
fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(ca != *cb);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }

    row[b.len()]
}
