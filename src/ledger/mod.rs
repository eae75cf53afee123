// src/ledger/mod.rs
// The durable abuse ledger: one record per (network address,
// fingerprint) pair, created lazily on first contact and never deleted
// automatically. All mutation runs under a per-record lock so two tabs
// racing the same visitor cannot lose an increment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::store::{get_json, set_json, KeyValueStore};

/// The approximate real-world visitor: network address plus derived
/// fingerprint. Neither half is unique on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VisitorId {
    pub network_address: String,
    pub fingerprint: String,
}

impl VisitorId {
    pub fn new(network_address: &str, fingerprint: &str) -> Self {
        VisitorId {
            network_address: network_address.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    pub fn ledger_key(&self) -> String {
        format!("ledger:{}:{}", self.network_address, self.fingerprint)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbuseRecord {
    pub network_address: String,
    pub fingerprint: String,
    #[serde(default)]
    pub ai_generation_count: u32,
    #[serde(default)]
    pub project_count: u32,
    #[serde(default)]
    pub session_count: u32,
    #[serde(default)]
    pub session_ids: Vec<String>,
    /// Most-recent AI call timestamps, trimmed to the configured ring
    /// capacity on every append.
    #[serde(default)]
    pub ai_call_window: Vec<u64>,
    #[serde(default)]
    pub session_creation_window: Vec<u64>,
    #[serde(default)]
    pub is_flagged: bool,
    #[serde(default)]
    pub flag_reason: Option<String>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub is_vpn_user: bool,
    #[serde(default)]
    pub extension_count: u32,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl AbuseRecord {
    fn new(visitor: &VisitorId, now: u64) -> Self {
        AbuseRecord {
            network_address: visitor.network_address.clone(),
            fingerprint: visitor.fingerprint.clone(),
            ai_generation_count: 0,
            project_count: 0,
            session_count: 0,
            session_ids: Vec::new(),
            ai_call_window: Vec::new(),
            session_creation_window: Vec::new(),
            is_flagged: false,
            flag_reason: None,
            is_blocked: false,
            block_reason: None,
            is_vpn_user: false,
            extension_count: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Timestamps still inside the trailing window of `window_seconds`.
    pub fn ai_calls_within(&self, window_seconds: u64, now: u64) -> Vec<u64> {
        let cutoff = now.saturating_sub(window_seconds);
        self.ai_call_window
            .iter()
            .copied()
            .filter(|ts| *ts >= cutoff)
            .collect()
    }

    pub fn sessions_created_within(&self, window_seconds: u64, now: u64) -> u32 {
        let cutoff = now.saturating_sub(window_seconds);
        self.session_creation_window
            .iter()
            .filter(|ts| **ts >= cutoff)
            .count() as u32
    }
}

/// Append-and-trim in one step: the buffer keeps only the most recent
/// `capacity` entries so a record can never grow without bound.
pub fn push_trimmed(window: &mut Vec<u64>, ts: u64, capacity: usize) {
    window.push(ts);
    if window.len() > capacity {
        let excess = window.len() - capacity;
        window.drain(0..excess);
    }
}

// One lock per ledger key, shared across concurrent requests in this
// instance. Entries are tiny and the visitor population per instance is
// small, so the registry is never pruned.
static RECORD_LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn record_lock(key: &str) -> Arc<Mutex<()>> {
    let mut locks = RECORD_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Read without creating. `Ok(None)` means no contact yet.
pub fn read_record<S: KeyValueStore>(
    store: &S,
    visitor: &VisitorId,
) -> Result<Option<AbuseRecord>, ()> {
    get_json(store, &visitor.ledger_key())
}

/// Atomic get-or-create plus mutate: loads (or lazily creates) the
/// record under its lock, applies `mutate`, stamps last_seen, and
/// persists. This is the only write path for ledger state.
pub fn with_record<S, F, T>(store: &S, visitor: &VisitorId, now: u64, mutate: F) -> Result<T, ()>
where
    S: KeyValueStore,
    F: FnOnce(&mut AbuseRecord) -> T,
{
    let key = visitor.ledger_key();
    let lock = record_lock(&key);
    let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let mut record =
        get_json::<S, AbuseRecord>(store, &key)?.unwrap_or_else(|| AbuseRecord::new(visitor, now));
    let out = mutate(&mut record);
    record.last_seen = record.last_seen.max(now);
    set_json(store, &key, &record)?;
    Ok(out)
}

/// Get-or-create without further mutation (the upsert the admission
/// checks rely on).
pub fn get_or_create<S: KeyValueStore>(
    store: &S,
    visitor: &VisitorId,
    now: u64,
) -> Result<AbuseRecord, ()> {
    with_record(store, visitor, now, |record| record.clone())
}

// Administrative actions. Each is a single idempotent write.

pub fn flag<S: KeyValueStore>(
    store: &S,
    visitor: &VisitorId,
    reason: &str,
    now: u64,
) -> Result<(), ()> {
    with_record(store, visitor, now, |record| {
        record.is_flagged = true;
        record.flag_reason = Some(reason.to_string());
    })
}

pub fn block<S: KeyValueStore>(
    store: &S,
    visitor: &VisitorId,
    reason: &str,
    now: u64,
) -> Result<(), ()> {
    with_record(store, visitor, now, |record| {
        record.is_blocked = true;
        record.block_reason = Some(reason.to_string());
    })
}

pub fn unblock<S: KeyValueStore>(store: &S, visitor: &VisitorId, now: u64) -> Result<(), ()> {
    with_record(store, visitor, now, |record| {
        record.is_blocked = false;
        record.block_reason = None;
    })
}

pub fn reset_counters<S: KeyValueStore>(store: &S, visitor: &VisitorId, now: u64) -> Result<(), ()> {
    with_record(store, visitor, now, |record| {
        record.ai_generation_count = 0;
        record.project_count = 0;
        record.session_count = 0;
        record.ai_call_window.clear();
        record.session_creation_window.clear();
        record.extension_count = 0;
    })
}

pub fn mark_vpn_user<S: KeyValueStore>(
    store: &S,
    visitor: &VisitorId,
    now: u64,
) -> Result<(), ()> {
    with_record(store, visitor, now, |record| {
        record.is_vpn_user = true;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use std::sync::Arc as StdArc;
    use std::thread;

    fn visitor() -> VisitorId {
        VisitorId::new("203.0.113.5", "fp-a")
    }

    #[test]
    fn get_or_create_is_an_upsert() {
        let store = MemoryStore::default();
        let first = get_or_create(&store, &visitor(), 100).unwrap();
        assert_eq!(first.first_seen, 100);

        let second = get_or_create(&store, &visitor(), 200).unwrap();
        assert_eq!(second.first_seen, 100, "existing record must be reused");
        assert_eq!(second.last_seen, 200);
    }

    #[test]
    fn records_are_keyed_by_address_and_fingerprint_jointly() {
        let store = MemoryStore::default();
        get_or_create(&store, &VisitorId::new("203.0.113.5", "fp-a"), 10).unwrap();
        get_or_create(&store, &VisitorId::new("203.0.113.5", "fp-b"), 20).unwrap();
        get_or_create(&store, &VisitorId::new("203.0.113.6", "fp-a"), 30).unwrap();

        let keys = store.get_keys().unwrap();
        assert_eq!(keys.iter().filter(|k| k.starts_with("ledger:")).count(), 3);
    }

    #[test]
    fn concurrent_increments_do_not_lose_updates() {
        let store = StdArc::new(MemoryStore::default());
        let threads: u32 = 16;
        let per_thread: u32 = 25;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = StdArc::clone(&store);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        with_record(store.as_ref(), &visitor(), 1_000 + u64::from(i), |record| {
                            record.ai_generation_count += 1;
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = read_record(store.as_ref(), &visitor()).unwrap().unwrap();
        assert_eq!(record.ai_generation_count, threads * per_thread);
    }

    #[test]
    fn window_append_trims_to_capacity() {
        let mut window = Vec::new();
        for ts in 0..100u64 {
            push_trimmed(&mut window, ts, 10);
        }
        assert_eq!(window.len(), 10);
        assert_eq!(window.first().copied(), Some(90));
        assert_eq!(window.last().copied(), Some(99));
    }

    #[test]
    fn admin_actions_are_idempotent() {
        let store = MemoryStore::default();
        block(&store, &visitor(), "abuse", 10).unwrap();
        block(&store, &visitor(), "abuse", 11).unwrap();
        let record = read_record(&store, &visitor()).unwrap().unwrap();
        assert!(record.is_blocked);
        assert_eq!(record.block_reason.as_deref(), Some("abuse"));

        unblock(&store, &visitor(), 12).unwrap();
        unblock(&store, &visitor(), 13).unwrap();
        let record = read_record(&store, &visitor()).unwrap().unwrap();
        assert!(!record.is_blocked);
        assert!(record.block_reason.is_none());
    }

    #[test]
    fn reset_counters_preserves_flags_and_identity() {
        let store = MemoryStore::default();
        with_record(&store, &visitor(), 10, |record| {
            record.ai_generation_count = 9;
            record.session_count = 4;
            record.ai_call_window = vec![1, 2, 3];
            record.is_flagged = true;
            record.flag_reason = Some("scripted".to_string());
        })
        .unwrap();

        reset_counters(&store, &visitor(), 20).unwrap();
        let record = read_record(&store, &visitor()).unwrap().unwrap();
        assert_eq!(record.ai_generation_count, 0);
        assert_eq!(record.session_count, 0);
        assert!(record.ai_call_window.is_empty());
        assert!(record.is_flagged, "flags survive a counter reset");
        assert_eq!(record.first_seen, 10);
    }

    #[test]
    fn sliding_window_helpers_filter_by_cutoff() {
        let mut record = AbuseRecord::new(&visitor(), 0);
        record.ai_call_window = vec![100, 200, 300, 400];
        let recent = record.ai_calls_within(150, 450);
        assert_eq!(recent, vec![300, 400]);
        record.session_creation_window = vec![100, 200, 300];
        assert_eq!(record.sessions_created_within(100, 310), 1);
        assert_eq!(record.sessions_created_within(300, 310), 3);
    }
}
