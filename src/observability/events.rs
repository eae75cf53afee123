// src/observability/events.rs
// Append-only audit log. Each event gets its own immutable KV key so
// concurrent writers never race a shared list; retention cleanup runs
// at most once per hour, piggybacked on whatever request arrives first.

use once_cell::sync::Lazy;
use rand::random;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::store::KeyValueStore;

const EVENTLOG_V2_PREFIX: &str = "eventlog:v2";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    SessionCreated,
    SessionDenied,
    SessionExtended,
    SessionReset,
    AiDenied,
    VisitorFlagged,
    VisitorBlocked,
    VisitorUnblocked,
    SessionReconciled,
    AdminAction,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EventLogEntry {
    pub ts: u64,
    pub event: EventType,
    pub network_address: Option<String>,
    pub fingerprint: Option<String>,
    pub session_id: Option<String>,
    pub reason: Option<String>,
    pub outcome: Option<String>,
}

static LAST_EVENTLOG_CLEANUP_HOUR: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

fn make_v2_event_key(hour: u64, ts: u64) -> String {
    format!(
        "{}:{}:{}-{:016x}",
        EVENTLOG_V2_PREFIX,
        hour,
        ts,
        random::<u64>()
    )
}

fn parse_v2_event_hour(key: &str) -> Option<u64> {
    let mut parts = key.splitn(4, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("eventlog"), Some("v2"), Some(hour)) => hour.parse::<u64>().ok(),
        _ => None,
    }
}

/// Audit logging never fails the caller; a dropped event is logged to
/// stderr and forgotten.
pub fn log_event<S: KeyValueStore>(store: &S, entry: &EventLogEntry) {
    let hour = entry.ts / 3600;
    let key = make_v2_event_key(hour, entry.ts);
    match serde_json::to_vec(entry) {
        Ok(payload) => {
            if store.set(&key, &payload).is_err() {
                eprintln!("[eventlog] KV error writing {}", key);
            }
        }
        Err(_) => eprintln!(
            "[eventlog] serialization error; dropping event for key {}",
            key
        ),
    }
}

/// Delete events older than the retention horizon. Latched to run once
/// per hour per instance.
pub fn maybe_cleanup<S: KeyValueStore>(store: &S, now: u64, retention_hours: u64) {
    if retention_hours == 0 {
        return;
    }
    let current_hour = now / 3600;
    {
        let mut last = LAST_EVENTLOG_CLEANUP_HOUR
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == current_hour {
            return;
        }
        *last = current_hour;
    }

    let cutoff_hour = current_hour.saturating_sub(retention_hours);
    if let Ok(keys) = store.get_keys() {
        for key in keys {
            let Some(event_hour) = parse_v2_event_hour(&key) else {
                continue;
            };
            if event_hour < cutoff_hour {
                if let Err(err) = store.delete(&key) {
                    eprintln!("[eventlog] failed deleting expired key {}: {:?}", key, err);
                }
            }
        }
    }
}

/// Events from the trailing `hours_back` hours, newest first. Admin
/// inspection only.
pub fn load_recent<S: KeyValueStore>(
    store: &S,
    now: u64,
    hours_back: u64,
) -> Result<Vec<EventLogEntry>, ()> {
    let current_hour = now / 3600;
    let min_hour = current_hour.saturating_sub(hours_back);
    let mut entries = Vec::new();
    for key in store.get_keys()? {
        let Some(hour) = parse_v2_event_hour(&key) else {
            continue;
        };
        if hour < min_hour {
            continue;
        }
        if let Some(raw) = store.get(&key)? {
            if let Ok(entry) = serde_json::from_slice::<EventLogEntry>(&raw) {
                entries.push(entry);
            }
        }
    }
    entries.sort_by(|a, b| b.ts.cmp(&a.ts));
    Ok(entries)
}
