use std::collections::BTreeMap;

use contracts::FlagValue;
use serde::{Deserialize, Serialize};

/// Per-player progression flags. Presence is what gates triggers; the value
/// only matters when a trigger or requirement names one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagStore {
    flags: BTreeMap<String, FlagValue>,
}

impl FlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FlagValue> {
        self.flags.get(key)
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.flags.contains_key(key)
    }

    /// Writes `value`, returning whether the stored value changed.
    pub fn set(&mut self, key: &str, value: FlagValue) -> bool {
        match self.flags.get(key) {
            Some(existing) if *existing == value => false,
            _ => {
                self.flags.insert(key.to_string(), value);
                true
            }
        }
    }

    /// Writes only when the key is absent.
    pub fn set_once(&mut self, key: &str, value: FlagValue) -> bool {
        if self.flags.contains_key(key) {
            return false;
        }
        self.flags.insert(key.to_string(), value);
        true
    }

    /// Present, and equal to `expected` when one is given.
    pub fn matches(&self, key: &str, expected: Option<&FlagValue>) -> bool {
        match (self.flags.get(key), expected) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FlagValue)> {
        self.flags.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, FlagValue> {
        &self.flags
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_changes_only() {
        let mut flags = FlagStore::new();
        assert!(flags.set("door", FlagValue::Bool(true)));
        assert!(!flags.set("door", FlagValue::Bool(true)));
        assert!(flags.set("door", FlagValue::from("open")));
    }

    #[test]
    fn set_once_keeps_first_value() {
        let mut flags = FlagStore::new();
        assert!(flags.set_once("session_opened", FlagValue::Bool(true)));
        assert!(!flags.set_once("session_opened", FlagValue::from("again")));
        assert_eq!(flags.get("session_opened"), Some(&FlagValue::Bool(true)));
    }

    #[test]
    fn matches_requires_exact_value_when_given() {
        let mut flags = FlagStore::new();
        flags.set("faction", FlagValue::from("nightshade"));
        assert!(flags.matches("faction", None));
        assert!(flags.matches("faction", Some(&FlagValue::from("nightshade"))));
        assert!(!flags.matches("faction", Some(&FlagValue::from("ironclad"))));
        assert!(!flags.matches("faction", Some(&FlagValue::Bool(true))));
        assert!(!flags.matches("missing", None));
    }
}
