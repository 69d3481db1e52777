//! Secret resolution for job handlers and service-step headers.
//!
//! Two sources: process environment (`env`) and a seeded in-process
//! table (`store`). Values never appear in persisted run records; the
//! executor redacts secret-bearing headers before writing step input.

use crate::types::{SecretRef, SecretSource};
use std::collections::HashMap;
use std::sync::RwLock;

/// Resolves secret references to plaintext values.
pub trait SecretStore: Send + Sync {
    /// Returns the secret value, or `None` when the key is unknown.
    fn resolve(&self, secret: &SecretRef) -> Option<String>;
}

/// Default store: `env` reads the process environment, `store` reads a
/// table seeded at startup (from configuration or tests). Versioned
/// store keys are addressed as `<key>@<version>` with the bare key
/// holding the current version.
#[derive(Default)]
pub struct InProcessSecretStore {
    values: RwLock<HashMap<String, String>>,
}

impl InProcessSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().unwrap().insert(key.into(), value.into());
    }

    pub fn seed_versioned(&self, key: &str, version: u32, value: impl Into<String>) {
        let value = value.into();
        let mut values = self.values.write().unwrap();
        values.insert(format!("{key}@{version}"), value.clone());
        values.insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) {
        self.values.write().unwrap().remove(key);
    }
}

impl SecretStore for InProcessSecretStore {
    fn resolve(&self, secret: &SecretRef) -> Option<String> {
        match secret.source {
            SecretSource::Env => std::env::var(&secret.key).ok(),
            SecretSource::Store => {
                let values = self.values.read().unwrap();
                match secret.version {
                    Some(version) => values.get(&format!("{}@{}", secret.key, version)).cloned(),
                    None => values.get(&secret.key).cloned(),
                }
            }
        }
    }
}
