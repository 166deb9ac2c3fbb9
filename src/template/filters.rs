//! Custom template filters

use minijinja::value::Value;
use minijinja::{Error, ErrorKind, State};

/// Register all custom filters with a minijinja Environment
pub fn register_filters(env: &mut minijinja::Environment) {
    env.add_filter("shell_escape", filter_shell_escape);
    env.add_filter("json", filter_json);
}

/// Quote a value for safe interpolation into an `sh` command
///
/// Plain words pass through; anything else is wrapped in single quotes with
/// embedded quotes escaped as `'\''`.
fn filter_shell_escape(_state: &State, value: Value) -> Result<Value, Error> {
    let s = value.to_string();

    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':'));
    if plain {
        return Ok(Value::from(s));
    }

    Ok(Value::from(format!("'{}'", s.replace('\'', "'\\''"))))
}

/// Serialize a value to a JSON string
fn filter_json(_state: &State, value: Value) -> Result<Value, Error> {
    serde_json::to_string(&value).map(Value::from).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("JSON serialization failed: {}", e),
        )
    })
}
