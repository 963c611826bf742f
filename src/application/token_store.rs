// Token store - Named values behind $token$ references
use crate::domain::error::DashboardError;
use crate::domain::token::{TokenLookup, TokenValue};
use std::collections::{BTreeMap, BTreeSet};

/// Current value of every set token. Mutation is serialized by the
/// orchestrator; the store itself is a plain owned map.
#[derive(Debug, Default)]
pub struct TokenStore {
    values: BTreeMap<String, TokenValue>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `value` under `name` and report which token names changed.
    /// Setting a token to its current value changes nothing and returns an
    /// empty set, so repeated identical submissions trigger no re-execution.
    pub fn set(&mut self, name: &str, value: TokenValue) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        if self.values.get(name) != Some(&value) {
            self.values.insert(name.to_string(), value);
            changed.insert(name.to_string());
        }
        changed
    }

    pub fn get(&self, name: &str) -> Result<&TokenValue, DashboardError> {
        self.values
            .get(name)
            .ok_or_else(|| DashboardError::MissingToken {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

impl TokenLookup for TokenStore {
    fn value(&self, name: &str) -> Option<&TokenValue> {
        self.values.get(name)
    }
}
