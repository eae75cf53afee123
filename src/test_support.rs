// src/test_support.rs
// Shared unit-test fixtures: an in-memory KeyValueStore and a
// process-wide env lock so tests that mutate environment variables
// cannot interleave.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::store::KeyValueStore;

/// HashMap-backed store with the same observable semantics as the Spin
/// key-value store.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn seeded(entries: &[(&str, &[u8])]) -> Self {
        let store = MemoryStore::default();
        {
            let mut data = store.data.lock().unwrap();
            for (key, value) in entries {
                data.insert(key.to_string(), value.to_vec());
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_keys(&self) -> Result<Vec<String>, ()> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes tests that read or write process environment variables.
pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
