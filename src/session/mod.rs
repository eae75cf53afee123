// src/session/mod.rs
// Demo session lifecycle. A session's expiry is anchored to the
// visitor's first demo start, not the session's own creation time, so
// opening a fresh session never restarts the clock. Expiry is computed
// on every read; physical deletion is the reconciler's job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::ledger::{self, VisitorId};
use crate::store::{get_json, set_json, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoMode {
    Solo,
    Team,
}

impl DemoMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "solo" => Some(DemoMode::Solo),
            "team" => Some(DemoMode::Team),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DemoSession {
    pub session_id: String,
    pub fingerprint: String,
    pub network_address: String,
    pub mode: DemoMode,
    pub created_at: u64,
    /// Earliest demo start across every live session this fingerprint
    /// has. Inherited on creation; the expiry anchor.
    pub first_demo_start: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub ai_generations_used: u32,
    #[serde(default)]
    pub projects_created: u32,
    #[serde(default)]
    pub export_attempts: u32,
    #[serde(default)]
    pub limitations_hit: Vec<String>,
    #[serde(default)]
    pub reset_count: u32,
}

impl DemoSession {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn seconds_remaining(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    #[cfg(test)]
    pub fn stub_for_tests(session_id: &str, fingerprint: &str, now: u64) -> Self {
        DemoSession {
            session_id: session_id.to_string(),
            fingerprint: fingerprint.to_string(),
            network_address: "203.0.113.5".to_string(),
            mode: DemoMode::Solo,
            created_at: now,
            first_demo_start: now,
            expires_at: now + 48 * 3600,
            ai_generations_used: 0,
            projects_created: 0,
            export_attempts: 0,
            limitations_hit: Vec::new(),
            reset_count: 0,
        }
    }
}

/// What a session-id lookup can resolve to. Absent and expired both
/// deny continuation; they differ only in what the caller reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    Expired(DemoSession),
    Active {
        session: DemoSession,
        expiring_soon: bool,
    },
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn visitor_index_key(fingerprint: &str) -> String {
    format!("visitor_sessions:{}", fingerprint)
}

pub fn new_session_id() -> String {
    let token: u128 = rand::thread_rng().gen();
    format!("demo-{:032x}", token)
}

// Same per-key lock idiom as the ledger: session mutation is
// read-modify-write and two tabs share one session.
static SESSION_LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn session_lock(key: &str) -> Arc<Mutex<()>> {
    let mut locks = SESSION_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

pub fn read_session<S: KeyValueStore>(
    store: &S,
    session_id: &str,
) -> Result<Option<DemoSession>, ()> {
    get_json(store, &session_key(session_id))
}

pub(crate) fn with_session<S, F>(
    store: &S,
    session_id: &str,
    mutate: F,
) -> Result<Option<DemoSession>, ()>
where
    S: KeyValueStore,
    F: FnOnce(&mut DemoSession),
{
    let key = session_key(session_id);
    let lock = session_lock(&key);
    let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let Some(mut session) = get_json::<S, DemoSession>(store, &key)? else {
        return Ok(None);
    };
    mutate(&mut session);
    set_json(store, &key, &session)?;
    Ok(Some(session))
}

/// Session ids currently indexed for a fingerprint. The index may lag
/// reality; callers re-check the session records themselves.
pub fn indexed_session_ids<S: KeyValueStore>(
    store: &S,
    fingerprint: &str,
) -> Result<Vec<String>, ()> {
    Ok(get_json::<S, Vec<String>>(store, &visitor_index_key(fingerprint))?.unwrap_or_default())
}

fn index_session<S: KeyValueStore>(store: &S, fingerprint: &str, session_id: &str) -> Result<(), ()> {
    let mut ids = indexed_session_ids(store, fingerprint)?;
    if !ids.iter().any(|id| id == session_id) {
        ids.push(session_id.to_string());
    }
    set_json(store, &visitor_index_key(fingerprint), &ids)
}

pub fn unindex_session<S: KeyValueStore>(
    store: &S,
    fingerprint: &str,
    session_id: &str,
) -> Result<(), ()> {
    let mut ids = indexed_session_ids(store, fingerprint)?;
    ids.retain(|id| id != session_id);
    if ids.is_empty() {
        store.delete(&visitor_index_key(fingerprint))
    } else {
        set_json(store, &visitor_index_key(fingerprint), &ids)
    }
}

/// The expiry anchor for a new session: the minimum first_demo_start
/// across every session still stored for the fingerprint, expired ones
/// included. Expiry alone does not free the clock; only reconciliation
/// (physical deletion) does, so re-entering in the gap between expiry
/// and the next reconcile pass cannot restart the demo.
fn inherited_first_start<S: KeyValueStore>(
    store: &S,
    fingerprint: &str,
    now: u64,
) -> Result<u64, ()> {
    let mut earliest = now;
    for id in indexed_session_ids(store, fingerprint)? {
        if let Some(session) = read_session(store, &id)? {
            earliest = earliest.min(session.first_demo_start);
        }
    }
    Ok(earliest)
}

/// Create and index a session under a caller-supplied id (admission
/// registers the id on the ledger before the record exists). Admission
/// has already been granted; this only establishes state.
pub fn create_with_id<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    visitor: &VisitorId,
    mode: DemoMode,
    session_id: &str,
    now: u64,
) -> Result<DemoSession, ()> {
    let first_demo_start = inherited_first_start(store, &visitor.fingerprint, now)?;
    let session = DemoSession {
        session_id: session_id.to_string(),
        fingerprint: visitor.fingerprint.clone(),
        network_address: visitor.network_address.clone(),
        mode,
        created_at: now,
        first_demo_start,
        expires_at: first_demo_start + cfg.limits.session_ttl_seconds(),
        ai_generations_used: 0,
        projects_created: 0,
        export_attempts: 0,
        limitations_hit: Vec::new(),
        reset_count: 0,
    };
    set_json(store, &session_key(&session.session_id), &session)?;
    index_session(store, &visitor.fingerprint, &session.session_id)?;
    Ok(session)
}

pub fn create<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    visitor: &VisitorId,
    mode: DemoMode,
    now: u64,
) -> Result<DemoSession, ()> {
    create_with_id(store, cfg, visitor, mode, &new_session_id(), now)
}

/// Resolve a session id to its current state; expiry is computed here,
/// never stored.
pub fn lookup<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    session_id: &str,
    now: u64,
) -> Result<SessionState, ()> {
    let Some(session) = read_session(store, session_id)? else {
        return Ok(SessionState::Absent);
    };
    if session.is_expired(now) {
        return Ok(SessionState::Expired(session));
    }
    let expiring_soon = session.seconds_remaining(now) <= cfg.expiring_soon_seconds;
    Ok(SessionState::Active {
        session,
        expiring_soon,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended { expires_at: u64 },
    SessionGone,
    ExtensionsExhausted,
}

/// Push the expiry out by one extension interval. The budget lives on
/// the visitor's ledger record so rotating sessions cannot mint fresh
/// extensions.
pub fn extend<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    visitor: &VisitorId,
    session_id: &str,
    now: u64,
) -> Result<ExtendOutcome, ()> {
    match lookup(store, cfg, session_id, now)? {
        SessionState::Active { .. } => {}
        _ => return Ok(ExtendOutcome::SessionGone),
    }

    let granted = ledger::with_record(store, visitor, now, |record| {
        if record.extension_count >= cfg.limits.max_extensions {
            false
        } else {
            record.extension_count += 1;
            true
        }
    })?;
    if !granted {
        return Ok(ExtendOutcome::ExtensionsExhausted);
    }

    let extended = with_session(store, session_id, |session| {
        session.expires_at += cfg.limits.extension_seconds();
    })?;
    match extended {
        Some(session) => Ok(ExtendOutcome::Extended {
            expires_at: session.expires_at,
        }),
        None => {
            // The session vanished between the budget grant and the
            // write (a reconciler race); hand the slot back.
            ledger::with_record(store, visitor, now, |record| {
                record.extension_count = record.extension_count.saturating_sub(1);
            })?;
            Ok(ExtendOutcome::SessionGone)
        }
    }
}

/// Clear session-scoped counters. The expiry anchor and the ledger are
/// untouched: a reset never buys more time or more quota.
pub fn reset<S: KeyValueStore>(store: &S, session_id: &str) -> Result<Option<DemoSession>, ()> {
    with_session(store, session_id, |session| {
        session.ai_generations_used = 0;
        session.projects_created = 0;
        session.export_attempts = 0;
        session.limitations_hit.clear();
        session.reset_count += 1;
    })
}

pub fn record_ai_use<S: KeyValueStore>(store: &S, session_id: &str) -> Result<(), ()> {
    with_session(store, session_id, |session| {
        session.ai_generations_used += 1;
    })
    .map(|_| ())
}

pub fn record_export<S: KeyValueStore>(store: &S, session_id: &str) -> Result<(), ()> {
    with_session(store, session_id, |session| {
        session.export_attempts += 1;
    })
    .map(|_| ())
}

pub fn record_limitation<S: KeyValueStore>(
    store: &S,
    session_id: &str,
    limitation: &str,
) -> Result<(), ()> {
    with_session(store, session_id, |session| {
        if !session.limitations_hit.iter().any(|l| l == limitation) {
            session.limitations_hit.push(limitation.to_string());
        }
    })
    .map(|_| ())
}

/// Physical removal, index included. Reconciler-only in practice.
pub fn remove<S: KeyValueStore>(store: &S, session: &DemoSession) -> Result<(), ()> {
    store.delete(&session_key(&session.session_id))?;
    unindex_session(store, &session.fingerprint, &session.session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::baseline_config;
    use crate::test_support::MemoryStore;

    fn visitor() -> VisitorId {
        VisitorId::new("203.0.113.5", "fp-session")
    }

    #[test]
    fn new_sessions_inherit_the_earliest_demo_start() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let t0 = 1_000_000;

        let first = create(&store, &cfg, &visitor(), DemoMode::Solo, t0).unwrap();
        assert_eq!(first.first_demo_start, t0);
        assert_eq!(first.expires_at, t0 + cfg.limits.session_ttl_seconds());

        // Ten hours later the visitor opens another tab. Same clock.
        let second = create(&store, &cfg, &visitor(), DemoMode::Team, t0 + 36_000).unwrap();
        assert_eq!(second.first_demo_start, t0);
        assert_eq!(second.expires_at, first.expires_at);
    }

    #[test]
    fn re_entry_after_expiry_before_reconciliation_keeps_the_old_clock() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let t0 = 1_000_000;
        let first = create(&store, &cfg, &visitor(), DemoMode::Solo, t0).unwrap();

        // The first session has expired but the reconciler has not run
        // yet. A new session inherits the spent clock and is born
        // expired; no visitor ever sees expires_at past t0 + TTL.
        let after_expiry = first.expires_at + 1;
        let second = create(&store, &cfg, &visitor(), DemoMode::Solo, after_expiry).unwrap();
        assert_eq!(second.first_demo_start, t0);
        assert_eq!(second.expires_at, first.expires_at);
        assert!(second.is_expired(after_expiry));
    }

    #[test]
    fn reconciled_visitor_starts_a_fresh_clock() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let t0 = 1_000_000;

        let first = create(&store, &cfg, &visitor(), DemoMode::Solo, t0).unwrap();
        remove(&store, &first).unwrap();

        let later = t0 + 100 * 3600;
        let second = create(&store, &cfg, &visitor(), DemoMode::Solo, later).unwrap();
        assert_eq!(second.first_demo_start, later);
    }

    #[test]
    fn expiry_is_computed_on_read() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let t0 = 500_000;
        let session = create(&store, &cfg, &visitor(), DemoMode::Solo, t0).unwrap();

        let live = lookup(&store, &cfg, &session.session_id, t0 + 10).unwrap();
        assert!(matches!(live, SessionState::Active { .. }));

        let after = t0 + cfg.limits.session_ttl_seconds();
        let gone = lookup(&store, &cfg, &session.session_id, after).unwrap();
        assert!(matches!(gone, SessionState::Expired(_)));
    }

    #[test]
    fn expiring_soon_flag_trips_inside_the_warning_window() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let t0 = 0;
        let session = create(&store, &cfg, &visitor(), DemoMode::Solo, t0).unwrap();

        let near = session.expires_at - cfg.expiring_soon_seconds + 1;
        match lookup(&store, &cfg, &session.session_id, near).unwrap() {
            SessionState::Active { expiring_soon, .. } => assert!(expiring_soon),
            other => panic!("unexpected state {:?}", other),
        }
        match lookup(&store, &cfg, &session.session_id, t0 + 10).unwrap() {
            SessionState::Active { expiring_soon, .. } => assert!(!expiring_soon),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn reset_clears_counters_but_never_the_clock() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let session = create(&store, &cfg, &visitor(), DemoMode::Solo, 1_000).unwrap();
        record_ai_use(&store, &session.session_id).unwrap();
        with_session(&store, &session.session_id, |s| s.projects_created += 2)
            .unwrap()
            .unwrap();
        record_limitation(&store, &session.session_id, "ai_window_cap").unwrap();

        let after = reset(&store, &session.session_id).unwrap().unwrap();
        assert_eq!(after.ai_generations_used, 0);
        assert_eq!(after.projects_created, 0);
        assert!(after.limitations_hit.is_empty());
        assert_eq!(after.reset_count, 1);
        assert_eq!(after.expires_at, session.expires_at);
        assert_eq!(after.first_demo_start, session.first_demo_start);
    }

    #[test]
    fn extensions_are_bounded_per_visitor_not_per_session() {
        let store = MemoryStore::default();
        let cfg = baseline_config(); // max_extensions = 2
        let t0 = 1_000;
        let a = create(&store, &cfg, &visitor(), DemoMode::Solo, t0).unwrap();
        let b = create(&store, &cfg, &visitor(), DemoMode::Solo, t0 + 1).unwrap();

        let one = extend(&store, &cfg, &visitor(), &a.session_id, t0 + 10).unwrap();
        assert!(matches!(one, ExtendOutcome::Extended { .. }));
        let two = extend(&store, &cfg, &visitor(), &b.session_id, t0 + 20).unwrap();
        assert!(matches!(two, ExtendOutcome::Extended { .. }));

        // The third attempt fails even on a session never extended
        // before: the budget is the visitor's.
        let three = extend(&store, &cfg, &visitor(), &a.session_id, t0 + 30).unwrap();
        assert_eq!(three, ExtendOutcome::ExtensionsExhausted);
    }

    #[test]
    fn extend_moves_the_expiry_by_one_interval() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let session = create(&store, &cfg, &visitor(), DemoMode::Solo, 0).unwrap();
        let outcome = extend(&store, &cfg, &visitor(), &session.session_id, 10).unwrap();
        assert_eq!(
            outcome,
            ExtendOutcome::Extended {
                expires_at: session.expires_at + cfg.limits.extension_seconds()
            }
        );
    }

    // Serves the session record a fixed number of reads, then reports
    // it gone; models the reconciler deleting it mid-request.
    struct VanishingStore {
        inner: MemoryStore,
        key: String,
        reads_left: Mutex<u32>,
    }

    impl KeyValueStore for VanishingStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()> {
            if key == self.key {
                let mut left = self.reads_left.lock().unwrap();
                if *left == 0 {
                    return Ok(None);
                }
                *left -= 1;
            }
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &[u8]) -> Result<(), ()> {
            self.inner.set(key, value)
        }
        fn delete(&self, key: &str) -> Result<(), ()> {
            self.inner.delete(key)
        }
        fn get_keys(&self) -> Result<Vec<String>, ()> {
            self.inner.get_keys()
        }
    }

    #[test]
    fn extension_slot_is_refunded_when_the_session_vanishes_mid_extend() {
        let cfg = baseline_config();
        let setup = MemoryStore::default();
        let session = create(&setup, &cfg, &visitor(), DemoMode::Solo, 1_000).unwrap();

        // One successful read covers the active-session lookup; the
        // locked write afterwards finds the record gone.
        let store = VanishingStore {
            inner: setup,
            key: session_key(&session.session_id),
            reads_left: Mutex::new(1),
        };
        let outcome = extend(&store, &cfg, &visitor(), &session.session_id, 1_010).unwrap();
        assert_eq!(outcome, ExtendOutcome::SessionGone);

        // The granted slot came back; the visitor keeps the full budget.
        let record = ledger::read_record(&store, &visitor()).unwrap().unwrap();
        assert_eq!(record.extension_count, 0);
    }

    #[test]
    fn extending_an_expired_session_is_refused() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let session = create(&store, &cfg, &visitor(), DemoMode::Solo, 0).unwrap();
        let after_expiry = session.expires_at + 1;
        let outcome = extend(&store, &cfg, &visitor(), &session.session_id, after_expiry).unwrap();
        assert_eq!(outcome, ExtendOutcome::SessionGone);
    }

    #[test]
    fn remove_drops_the_session_and_its_index_entry() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let session = create(&store, &cfg, &visitor(), DemoMode::Solo, 0).unwrap();
        assert_eq!(
            indexed_session_ids(&store, "fp-session").unwrap(),
            vec![session.session_id.clone()]
        );

        remove(&store, &session).unwrap();
        assert!(read_session(&store, &session.session_id).unwrap().is_none());
        assert!(indexed_session_ids(&store, "fp-session").unwrap().is_empty());
    }
}
