// src/reconcile/mod.rs
// Brings stored state back in line with the expiry policy: finds
// sessions whose expiry elapsed by a safety margin, purges the content
// created under them, resets the official demo boards to baseline, and
// finally deletes the session records. One session failing is logged
// and skipped; it stays expired and is retried on the next run.

use std::collections::HashSet;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::config::Config;
use crate::content;
use crate::ledger::{self, VisitorId};
use crate::observability::events::{self, EventLogEntry, EventType};
use crate::observability::metrics::{self, MetricName};
use crate::session::{self, DemoSession};
use crate::store::{get_json, KeyValueStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub sessions_examined: u32,
    pub sessions_reconciled: u32,
    pub content_deleted: u32,
    pub boards_reset: u32,
    pub failures: u32,
}

/// A session is reconcilable only once its expiry has elapsed by the
/// safety margin, so a request that just confirmed it active cannot
/// race its deletion.
fn is_reconcilable(session: &DemoSession, cfg: &Config, now: u64) -> bool {
    now > session.expires_at + cfg.reconcile_safety_margin_seconds
}

fn expired_sessions<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    now: u64,
) -> Result<Vec<DemoSession>, ()> {
    let mut expired = Vec::new();
    for key in store.get_keys()? {
        if !key.starts_with("session:") {
            continue;
        }
        let Some(session) = get_json::<S, DemoSession>(store, &key)? else {
            continue;
        };
        if is_reconcilable(&session, cfg, now) {
            expired.push(session);
        }
    }
    Ok(expired)
}

/// Every identifier this session's content could have been tagged
/// with: the session id itself, the visitor fingerprint (historical
/// rows), and every session id ever issued to that fingerprint, from
/// both the live index and the ledger.
fn identifier_closure<S: KeyValueStore>(
    store: &S,
    session: &DemoSession,
) -> Result<HashSet<String>, ()> {
    let mut closure = HashSet::new();
    closure.insert(session.session_id.clone());
    closure.insert(session.fingerprint.clone());
    for id in session::indexed_session_ids(store, &session.fingerprint)? {
        closure.insert(id);
    }
    let visitor = VisitorId::new(&session.network_address, &session.fingerprint);
    if let Some(record) = ledger::read_record(store, &visitor)? {
        for id in record.session_ids {
            closure.insert(id);
        }
    }
    Ok(closure)
}

fn reconcile_one<S: KeyValueStore>(
    store: &S,
    session: &DemoSession,
    now: u64,
) -> Result<u32, ()> {
    let closure = identifier_closure(store, session)?;
    let purge = content::purge_tagged(store, &closure)?;

    events::log_event(
        store,
        &EventLogEntry {
            ts: now,
            event: EventType::SessionReconciled,
            network_address: Some(session.network_address.clone()),
            fingerprint: Some(session.fingerprint.clone()),
            session_id: Some(session.session_id.clone()),
            reason: None,
            outcome: Some(format!(
                "deleted {} comments, {} tasks, {} boards",
                purge.comments_deleted, purge.tasks_deleted, purge.boards_deleted
            )),
        },
    );

    session::remove(store, session)?;
    Ok(purge.total_deleted())
}

/// One full reconciliation pass. `Err` only when the session keyspace
/// itself cannot be listed; individual session failures are counted and
/// retried next run.
pub fn run_with_now<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    now: u64,
) -> Result<ReconcileSummary, ()> {
    let expired = expired_sessions(store, cfg, now)?;
    let mut summary = ReconcileSummary {
        sessions_examined: expired.len() as u32,
        ..ReconcileSummary::default()
    };

    for session in &expired {
        match reconcile_one(store, session, now) {
            Ok(deleted) => {
                summary.sessions_reconciled += 1;
                summary.content_deleted += deleted;
            }
            Err(()) => {
                eprintln!(
                    "[reconcile] failed reconciling session {}; retrying next run",
                    session.session_id
                );
                summary.failures += 1;
            }
        }
    }

    if summary.sessions_reconciled > 0 {
        for board in content::official_boards(store)? {
            match content::reset_official_board(store, &board) {
                Ok(touched) if touched > 0 => summary.boards_reset += 1,
                Ok(_) => {}
                Err(()) => {
                    eprintln!("[reconcile] failed resetting official board {}", board.id);
                    summary.failures += 1;
                }
            }
        }
    }

    metrics::increment_by(
        store,
        MetricName::SessionsReconciledTotal,
        None,
        summary.sessions_reconciled as u64,
    );
    metrics::increment_by(
        store,
        MetricName::ContentDeletedTotal,
        None,
        summary.content_deleted as u64,
    );
    metrics::increment_by(
        store,
        MetricName::BoardsResetTotal,
        None,
        summary.boards_reset as u64,
    );
    metrics::increment_by(
        store,
        MetricName::ReconcileFailuresTotal,
        None,
        summary.failures as u64,
    );

    if summary.sessions_examined > 0 {
        println!(
            "[reconcile] examined={} reconciled={} content_deleted={} boards_reset={} failures={}",
            summary.sessions_examined,
            summary.sessions_reconciled,
            summary.content_deleted,
            summary.boards_reset,
            summary.failures
        );
    }
    Ok(summary)
}

// There is no timer in this runtime; reconciliation piggybacks on
// request traffic, latched to at most one pass per interval per
// instance. Admin can always force a pass.
static LAST_RECONCILE_BUCKET: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

pub fn maybe_run_with_now<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    now: u64,
) -> Option<ReconcileSummary> {
    let interval = cfg.reconcile_interval_seconds.max(1);
    let bucket = now / interval;
    {
        let mut last = LAST_RECONCILE_BUCKET
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == bucket {
            return None;
        }
        *last = bucket;
    }
    match run_with_now(store, cfg, now) {
        Ok(summary) => Some(summary),
        Err(()) => {
            eprintln!("[reconcile][KV OUTAGE] could not list sessions; pass skipped");
            None
        }
    }
}
