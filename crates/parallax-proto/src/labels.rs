//! Runner labels and placement predicates.
//!
//! Labels are a JSON map of scalar or list values attached to each runner.
//! A predicate (itself a label map) matches a runner when every predicate key
//! is present and compatible: list-valued predicate entries must be wholly
//! contained in the runner's list for that key, scalar entries must be equal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, Value>);

impl Labels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The conventional predicate used when placing a deployment: the runner
    /// must advertise the deployment's language.
    #[must_use]
    pub fn language(language: &str) -> Self {
        Self::new().with("languages", vec![language.to_owned()])
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Does this label set satisfy `predicate`?
    #[must_use]
    pub fn matches(&self, predicate: &Labels) -> bool {
        predicate.0.iter().all(|(key, want)| {
            let Some(have) = self.0.get(key) else {
                return false;
            };
            match (want, have) {
                (Value::Array(want), Value::Array(have)) => {
                    want.iter().all(|item| have.contains(item))
                }
                // A list predicate never matches a scalar value.
                (Value::Array(_), _) => false,
                (want, have) => want == have,
            }
        })
    }
}

impl FromIterator<(String, Value)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_predicate_matches_everything() {
        let runner = Labels::new().with("arch", "aarch64");
        assert!(runner.matches(&Labels::new()));
        assert!(Labels::new().matches(&Labels::new()));
    }

    #[test]
    fn scalar_entries_compare_by_equality() {
        let runner = Labels::new().with("arch", "aarch64").with("zone", "a");
        assert!(runner.matches(&Labels::new().with("arch", "aarch64")));
        assert!(!runner.matches(&Labels::new().with("arch", "x86_64")));
        assert!(!runner.matches(&Labels::new().with("region", "eu")));
    }

    #[test]
    fn list_entries_match_by_containment() {
        let runner: Labels = serde_json::from_value(json!({
            "languages": ["go", "rust", "kotlin"],
        }))
        .unwrap();
        assert!(runner.matches(&Labels::language("rust")));
        assert!(runner.matches(&serde_json::from_value(json!({
            "languages": ["go", "kotlin"],
        }))
        .unwrap()));
        assert!(!runner.matches(&Labels::language("python")));
    }

    #[test]
    fn list_predicate_rejects_scalar_value() {
        let runner = Labels::new().with("languages", "rust");
        assert!(!runner.matches(&Labels::language("rust")));
    }
}
