//! Ephemeral node metadata registry
//!
//! Agents re-register their reachable endpoint over a long-poll connection;
//! entries live only for the process lifetime and are pruned on every
//! successful inventory sync.

use std::collections::HashMap;
use std::sync::Mutex;

/// Where to reach one agent's API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMetadata {
    pub fingerprint: String,
    pub ip: String,
    pub api_port: u16,
}

#[derive(Debug, Default)]
pub struct NodeMetadataStore {
    by_fingerprint: Mutex<HashMap<String, NodeMetadata>>,
}

impl NodeMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, fingerprint: String, meta: NodeMetadata) {
        self.by_fingerprint.lock().unwrap().insert(fingerprint, meta);
    }

    pub fn get(&self, fingerprint: &str) -> Option<NodeMetadata> {
        self.by_fingerprint.lock().unwrap().get(fingerprint).cloned()
    }

    pub fn list(&self) -> Vec<NodeMetadata> {
        self.by_fingerprint.lock().unwrap().values().cloned().collect()
    }

    /// Drops every entry whose fingerprint fails the predicate.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.by_fingerprint
            .lock()
            .unwrap()
            .retain(|fingerprint, _| keep(fingerprint));
    }
}
