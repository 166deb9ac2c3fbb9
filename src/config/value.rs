//! Dynamic task configuration values
//!
//! Task configuration is an arbitrary nested mapping. Values are kept as a
//! tagged union with typed accessors so that operators fail with a
//! [`ConfigError`] on a shape mismatch instead of guessing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised by typed config accessors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("config key '{key}' is missing")]
    MissingKey { key: String },

    #[error("config key '{key}' has type {actual}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// A single configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Sequence(Vec<ConfigValue>),
    Mapping(ConfigMap),
}

impl ConfigValue {
    /// Name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigValue::Null => "null",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Integer(_) => "integer",
            ConfigValue::Float(_) => "float",
            ConfigValue::String(_) => "string",
            ConfigValue::Sequence(_) => "sequence",
            ConfigValue::Mapping(_) => "mapping",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&ConfigMap> {
        match self {
            ConfigValue::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Visit every string leaf, depth first, in key order
    pub fn for_each_str<'a>(&'a self, f: &mut dyn FnMut(&'a str)) {
        match self {
            ConfigValue::String(s) => f(s),
            ConfigValue::Sequence(items) => items.iter().for_each(|v| v.for_each_str(f)),
            ConfigValue::Mapping(map) => map.values().for_each(|v| v.for_each_str(f)),
            _ => {}
        }
    }

    /// Rebuild the value with every string leaf passed through `f`
    pub fn try_map_str<E>(
        &self,
        f: &mut dyn FnMut(&str) -> Result<String, E>,
    ) -> Result<ConfigValue, E> {
        Ok(match self {
            ConfigValue::String(s) => ConfigValue::String(f(s)?),
            ConfigValue::Sequence(items) => ConfigValue::Sequence(
                items
                    .iter()
                    .map(|v| v.try_map_str(f))
                    .collect::<Result<_, _>>()?,
            ),
            ConfigValue::Mapping(map) => ConfigValue::Mapping(map.try_map_str(f)?),
            other => other.clone(),
        })
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Null => write!(f, "null"),
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Integer(i) => write!(f, "{}", i),
            ConfigValue::Float(x) => write!(f, "{}", x),
            ConfigValue::String(s) => write!(f, "{}", s),
            other => match serde_json::to_string(other) {
                Ok(json) => write!(f, "{}", json),
                Err(_) => write!(f, "<{}>", other.kind()),
            },
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Integer(i)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<ConfigMap> for ConfigValue {
    fn from(map: ConfigMap) -> Self {
        ConfigValue::Mapping(map)
    }
}

/// String-keyed configuration mapping with typed lookups
///
/// Backed by a `BTreeMap` so iteration order (and therefore compilation and
/// serialization) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigMap(BTreeMap<String, ConfigValue>);

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &ConfigValue> {
        self.0.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every entry of `other` into this map, overwriting existing keys
    pub fn extend_from(&mut self, other: &ConfigMap) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    fn require(&self, key: &str) -> Result<&ConfigValue, ConfigError> {
        self.0.get(key).ok_or_else(|| ConfigError::MissingKey {
            key: key.to_string(),
        })
    }

    fn mismatch(key: &str, expected: &'static str, actual: &ConfigValue) -> ConfigError {
        ConfigError::TypeMismatch {
            key: key.to_string(),
            expected,
            actual: actual.kind(),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<&str, ConfigError> {
        let value = self.require(key)?;
        value
            .as_str()
            .ok_or_else(|| Self::mismatch(key, "string", value))
    }

    /// Like [`get_str`](Self::get_str) but a missing key is `Ok(None)`
    pub fn get_opt_str(&self, key: &str) -> Result<Option<&str>, ConfigError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| Self::mismatch(key, "string", value)),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, ConfigError> {
        let value = self.require(key)?;
        value
            .as_i64()
            .ok_or_else(|| Self::mismatch(key, "integer", value))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, ConfigError> {
        let value = self.require(key)?;
        value
            .as_f64()
            .ok_or_else(|| Self::mismatch(key, "float", value))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let value = self.require(key)?;
        value
            .as_bool()
            .ok_or_else(|| Self::mismatch(key, "bool", value))
    }

    pub fn get_sequence(&self, key: &str) -> Result<&[ConfigValue], ConfigError> {
        let value = self.require(key)?;
        value
            .as_sequence()
            .ok_or_else(|| Self::mismatch(key, "sequence", value))
    }

    pub fn get_mapping(&self, key: &str) -> Result<&ConfigMap, ConfigError> {
        let value = self.require(key)?;
        value
            .as_mapping()
            .ok_or_else(|| Self::mismatch(key, "mapping", value))
    }

    pub fn try_map_str<E>(
        &self,
        f: &mut dyn FnMut(&str) -> Result<String, E>,
    ) -> Result<ConfigMap, E> {
        let mut out = BTreeMap::new();
        for (k, v) in &self.0 {
            out.insert(k.clone(), v.try_map_str(f)?);
        }
        Ok(ConfigMap(out))
    }
}

impl FromIterator<(String, ConfigValue)> for ConfigMap {
    fn from_iter<T: IntoIterator<Item = (String, ConfigValue)>>(iter: T) -> Self {
        ConfigMap(iter.into_iter().collect())
    }
}
