// src/store.rs
// Narrow key-value abstraction over the Spin store. Error detail is
// deliberately flattened to `()`: callers decide between fail-open and
// fail-closed, not the storage layer.

use serde::de::DeserializeOwned;
use serde::Serialize;
use spin_sdk::key_value::Store;

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()>;
    fn delete(&self, key: &str) -> Result<(), ()>;
    fn get_keys(&self) -> Result<Vec<String>, ()>;
}

impl KeyValueStore for Store {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()> {
        Store::get(self, key).map_err(|_| ())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()> {
        Store::set(self, key, value).map_err(|_| ())
    }

    fn delete(&self, key: &str) -> Result<(), ()> {
        Store::delete(self, key).map_err(|_| ())
    }

    fn get_keys(&self) -> Result<Vec<String>, ()> {
        Store::get_keys(self).map_err(|_| ())
    }
}

/// Stand-in used when the default store cannot even be opened; every
/// operation reports an outage so the fail-open paths engage.
pub struct UnavailableStore;

impl KeyValueStore for UnavailableStore {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, ()> {
        Err(())
    }

    fn set(&self, _key: &str, _value: &[u8]) -> Result<(), ()> {
        Err(())
    }

    fn delete(&self, _key: &str) -> Result<(), ()> {
        Err(())
    }

    fn get_keys(&self) -> Result<Vec<String>, ()> {
        Err(())
    }
}

/// JSON read helper. A corrupt payload reads as absent rather than an
/// outage; the record will simply be rebuilt.
pub fn get_json<S: KeyValueStore, T: DeserializeOwned>(
    store: &S,
    key: &str,
) -> Result<Option<T>, ()> {
    match store.get(key)? {
        Some(raw) => Ok(serde_json::from_slice::<T>(&raw).ok()),
        None => Ok(None),
    }
}

pub fn set_json<S: KeyValueStore, T: Serialize>(store: &S, key: &str, value: &T) -> Result<(), ()> {
    let raw = serde_json::to_vec(value).map_err(|_| ())?;
    store.set(key, &raw)
}
