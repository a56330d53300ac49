//! Environment-variable list handling.
//!
//! Environment entries travel as `KEY=VALUE` strings. Lists are
//! validated once at the edge and deduplicated on merge: entries from
//! the higher-precedence list come first, and later occurrences of a
//! key already seen are dropped.

use crate::SchemaError;

/// A validated, ordered list of `KEY=VALUE` environment entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env(Vec<(String, String)>);

impl Env {
    /// Validate raw entries. Each must contain `=` with a non-empty key.
    pub fn new(entries: &[String]) -> Result<Self, SchemaError> {
        let mut pairs = Vec::with_capacity(entries.len());
        for entry in entries {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| SchemaError::MalformedEnvironment(entry.clone()))?;
            if key.is_empty() {
                return Err(SchemaError::MalformedEnvironment(entry.clone()));
            }
            pairs.push((key.to_owned(), value.to_owned()));
        }
        Ok(Self(pairs))
    }

    /// Merge `other` after `self`: entries of `self` win on duplicate
    /// keys, and the relative order within each list is preserved.
    pub fn merge(&self, other: &Env) -> Env {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            if !merged.iter().any(|(k, _)| k == key) {
                merged.push((key.clone(), value.clone()));
            }
        }
        Env(merged)
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
