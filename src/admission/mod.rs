// src/admission/mod.rs
// Global admission control: quota and rate decisions against the abuse
// ledger, independent of any single session. Checks are idempotent
// reads; the try_admit_* entry points fold check and increment into one
// locked ledger transaction so racing tabs cannot overshoot a cap.
// A dead store fails open, loudly.

use serde::Serialize;

use crate::config::Config;
use crate::ledger::{self, push_trimmed, AbuseRecord, VisitorId};
use crate::session::DemoSession;
use crate::store::KeyValueStore;

/// Outcome of an admission check. Expected denials are values, not
/// errors; `wait_seconds` is set when the sliding window is full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub wait_seconds: Option<u64>,
}

impl Decision {
    pub fn allow() -> Self {
        Decision {
            allowed: true,
            reason: None,
            wait_seconds: None,
        }
    }

    pub fn deny(reason: &str) -> Self {
        Decision {
            allowed: false,
            reason: Some(reason.to_string()),
            wait_seconds: None,
        }
    }

    pub fn deny_for(reason: &str, wait_seconds: u64) -> Self {
        Decision {
            allowed: false,
            reason: Some(reason.to_string()),
            wait_seconds: Some(wait_seconds),
        }
    }

    fn degraded(context: &str) -> Self {
        eprintln!(
            "[admission][KV OUTAGE] ledger unreachable during {}; failing open",
            context
        );
        Decision {
            allowed: true,
            reason: Some("degraded_store".to_string()),
            wait_seconds: None,
        }
    }
}

/// Pure decision over a ledger snapshot. `None` means first contact:
/// nothing counted yet, always admissible.
fn evaluate_session_creation(record: Option<&AbuseRecord>, cfg: &Config, now: u64) -> Decision {
    let Some(record) = record else {
        return Decision::allow();
    };
    if record.is_blocked {
        return Decision::deny("visitor_blocked");
    }

    let limits = &cfg.limits;
    let cap = limits.effective_max_sessions(record.is_vpn_user);
    if record.session_count >= cap {
        return Decision::deny("session_lifetime_cap");
    }
    if record.sessions_created_within(3600, now) >= limits.sessions_per_hour {
        return Decision::deny("session_rate_hourly");
    }
    if record.sessions_created_within(24 * 3600, now) >= limits.sessions_per_day {
        return Decision::deny("session_rate_daily");
    }
    Decision::allow()
}

fn evaluate_ai_generation(record: Option<&AbuseRecord>, cfg: &Config, now: u64) -> Decision {
    let Some(record) = record else {
        return Decision::allow();
    };
    if record.is_blocked {
        return Decision::deny("visitor_blocked");
    }

    let limits = &cfg.limits;
    // Gate 1: lifetime cap across every session this visitor ever had.
    let lifetime_cap = limits.effective_max_ai_generations(record.is_vpn_user);
    if record.ai_generation_count >= lifetime_cap {
        return Decision::deny("ai_lifetime_cap");
    }

    // Gate 2: K calls per trailing W minutes.
    let window_limit = limits.effective_ai_window_limit(record.is_vpn_user) as usize;
    if window_limit == 0 {
        return Decision::deny("ai_window_cap");
    }
    let recent = record.ai_calls_within(limits.ai_window_seconds(), now);
    if recent.len() >= window_limit {
        // The window reopens when enough of the oldest entries age out.
        let reopen_at = recent[recent.len() - window_limit] + limits.ai_window_seconds();
        let wait = reopen_at.saturating_sub(now).max(1);
        return Decision::deny_for("ai_window_cap", wait);
    }
    Decision::allow()
}

/// Read-only session-creation check (used for status surfaces; the
/// write path goes through `try_admit_session_creation`).
pub fn check_session_creation<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    visitor: &VisitorId,
    now: u64,
) -> Decision {
    match ledger::read_record(store, visitor) {
        Ok(record) => evaluate_session_creation(record.as_ref(), cfg, now),
        Err(()) => Decision::degraded("session creation check"),
    }
}

pub fn check_ai_generation<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    visitor: &VisitorId,
    now: u64,
) -> Decision {
    match ledger::read_record(store, visitor) {
        Ok(record) => evaluate_ai_generation(record.as_ref(), cfg, now),
        Err(()) => Decision::degraded("ai generation check"),
    }
}

/// Per-session project cap; unlike the ledger gates this one resets
/// with every new session.
pub fn check_project_creation(session: &DemoSession, cfg: &Config) -> Decision {
    if session.projects_created >= cfg.limits.max_projects_per_session {
        Decision::deny("project_session_cap")
    } else {
        Decision::allow()
    }
}

/// Check-and-increment under the record lock. On admission the session
/// id joins the ledger and the creation window advances.
pub fn try_admit_session_creation<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    visitor: &VisitorId,
    session_id: &str,
    now: u64,
) -> Decision {
    let outcome = ledger::with_record(store, visitor, now, |record| {
        let decision = evaluate_session_creation(Some(record), cfg, now);
        if decision.allowed {
            record.session_count += 1;
            if !record.session_ids.iter().any(|id| id == session_id) {
                record.session_ids.push(session_id.to_string());
            }
            push_trimmed(&mut record.session_creation_window, now, cfg.window_capacity);
        }
        decision
    });
    match outcome {
        Ok(decision) => decision,
        Err(()) => Decision::degraded("session creation admit"),
    }
}

pub fn try_admit_ai_generation<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    visitor: &VisitorId,
    now: u64,
) -> Decision {
    let outcome = ledger::with_record(store, visitor, now, |record| {
        let decision = evaluate_ai_generation(Some(record), cfg, now);
        if decision.allowed {
            record.ai_generation_count += 1;
            push_trimmed(&mut record.ai_call_window, now, cfg.window_capacity);
        }
        decision
    });
    match outcome {
        Ok(decision) => decision,
        Err(()) => Decision::degraded("ai generation admit"),
    }
}

/// Check-and-increment for the per-session project cap, folded into one
/// write under the session lock so racing tabs cannot overshoot it.
/// `None` means the session record vanished between the caller's lookup
/// and this transaction.
pub fn try_admit_project_creation<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    session_id: &str,
) -> Option<Decision> {
    let mut decision = None;
    let outcome = crate::session::with_session(store, session_id, |session| {
        let d = check_project_creation(session, cfg);
        if d.allowed {
            session.projects_created += 1;
        }
        decision = Some(d);
    });
    match outcome {
        Ok(Some(_)) => decision,
        Ok(None) => None,
        Err(()) => Some(Decision::degraded("project creation admit")),
    }
}

/// Ledger side of a successful project creation (the per-session cap
/// itself is enforced against the session record).
pub fn record_project_creation<S: KeyValueStore>(
    store: &S,
    visitor: &VisitorId,
    now: u64,
) -> Result<(), ()> {
    ledger::with_record(store, visitor, now, |record| {
        record.project_count += 1;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::baseline_config;
    use crate::store::UnavailableStore;
    use crate::test_support::MemoryStore;
    use std::sync::Arc;
    use std::thread;

    fn visitor() -> VisitorId {
        VisitorId::new("203.0.113.5", "fp-admission")
    }

    #[test]
    fn first_contact_is_admissible_without_creating_state() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        let decision = check_session_creation(&store, &cfg, &visitor(), 1_000);
        assert!(decision.allowed);
        // The check is an idempotent read: no ledger record appears.
        assert!(ledger::read_record(&store, &visitor()).unwrap().is_none());
    }

    #[test]
    fn blocked_visitor_is_denied_everything() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        ledger::block(&store, &visitor(), "operator ban", 10).unwrap();

        let session = check_session_creation(&store, &cfg, &visitor(), 20);
        assert!(!session.allowed);
        assert_eq!(session.reason.as_deref(), Some("visitor_blocked"));
        let ai = check_ai_generation(&store, &cfg, &visitor(), 20);
        assert!(!ai.allowed);
    }

    #[test]
    fn sliding_window_denies_sixth_call_with_wait_then_reopens() {
        let store = MemoryStore::default();
        let cfg = baseline_config(); // K=5, W=10min
        let t0 = 100_000;

        for i in 0..5 {
            let decision = try_admit_ai_generation(&store, &cfg, &visitor(), t0 + i);
            assert!(decision.allowed, "call {} should be admitted", i);
        }

        let sixth = try_admit_ai_generation(&store, &cfg, &visitor(), t0 + 10);
        assert!(!sixth.allowed);
        assert_eq!(sixth.reason.as_deref(), Some("ai_window_cap"));
        let wait = sixth.wait_seconds.expect("full window must carry a wait");
        assert!(wait > 0 && wait <= cfg.limits.ai_window_seconds());

        // After the window elapses the same call is admitted.
        let later = t0 + cfg.limits.ai_window_seconds() + 5;
        let retry = try_admit_ai_generation(&store, &cfg, &visitor(), later);
        assert!(retry.allowed);
    }

    #[test]
    fn lifetime_cap_gate_is_independent_of_the_window() {
        let store = MemoryStore::default();
        let mut cfg = baseline_config();
        cfg.limits.max_ai_generations = 3;
        cfg.limits.ai_window_limit = 100;

        for i in 0..3 {
            assert!(try_admit_ai_generation(&store, &cfg, &visitor(), 1_000 + i * 700).allowed);
        }
        let denied = try_admit_ai_generation(&store, &cfg, &visitor(), 10_000);
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some("ai_lifetime_cap"));
        assert!(denied.wait_seconds.is_none());
    }

    #[test]
    fn vpn_visitor_gets_exactly_half_the_caps() {
        let cfg = baseline_config();
        let t0 = 50_000;

        let baseline_store = MemoryStore::default();
        let vpn_store = MemoryStore::default();
        let v = visitor();
        ledger::mark_vpn_user(&vpn_store, &v, t0).unwrap();

        let mut baseline_admitted = 0;
        let mut vpn_admitted = 0;
        // Space calls out so the sliding window never interferes.
        for i in 0..cfg.limits.max_ai_generations {
            let ts = t0 + (i as u64) * cfg.limits.ai_window_seconds();
            if try_admit_ai_generation(&baseline_store, &cfg, &v, ts).allowed {
                baseline_admitted += 1;
            }
            if try_admit_ai_generation(&vpn_store, &cfg, &v, ts).allowed {
                vpn_admitted += 1;
            }
        }
        assert_eq!(baseline_admitted, cfg.limits.max_ai_generations);
        assert_eq!(vpn_admitted, cfg.limits.max_ai_generations / 2);
    }

    #[test]
    fn vpn_visitor_session_cap_is_halved_too() {
        let store = MemoryStore::default();
        let mut cfg = baseline_config();
        cfg.limits.sessions_per_hour = 1_000;
        cfg.limits.sessions_per_day = 1_000;
        let v = visitor();
        ledger::mark_vpn_user(&store, &v, 0).unwrap();

        let mut admitted = 0;
        for i in 0..cfg.limits.max_sessions {
            let id = format!("s{}", i);
            if try_admit_session_creation(&store, &cfg, &v, &id, 1_000 + i as u64).allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, cfg.limits.max_sessions / 2);
    }

    #[test]
    fn hourly_session_rate_is_enforced() {
        let store = MemoryStore::default();
        let cfg = baseline_config(); // 3 per hour
        let v = visitor();
        let t0 = 1_000_000;

        for i in 0..3 {
            let id = format!("s{}", i);
            assert!(try_admit_session_creation(&store, &cfg, &v, &id, t0 + i).allowed);
        }
        let fourth = try_admit_session_creation(&store, &cfg, &v, "s3", t0 + 10);
        assert!(!fourth.allowed);
        assert_eq!(fourth.reason.as_deref(), Some("session_rate_hourly"));

        // An hour later the hourly gate reopens (daily cap still looms).
        let fifth = try_admit_session_creation(&store, &cfg, &v, "s4", t0 + 3700);
        assert!(fifth.allowed);
    }

    #[test]
    fn concurrent_admissions_never_exceed_the_cap() {
        let store = Arc::new(MemoryStore::default());
        let mut cfg = baseline_config();
        cfg.limits.max_ai_generations = 10;
        cfg.limits.ai_window_limit = 1_000;
        let cfg = Arc::new(cfg);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                let cfg = Arc::clone(&cfg);
                thread::spawn(move || {
                    let mut admitted = 0u32;
                    for i in 0..10 {
                        let decision = try_admit_ai_generation(
                            store.as_ref(),
                            &cfg,
                            &visitor(),
                            1_000 + t * 10 + i,
                        );
                        if decision.allowed {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, cfg.limits.max_ai_generations);
        let record = ledger::read_record(store.as_ref(), &visitor())
            .unwrap()
            .unwrap();
        assert_eq!(record.ai_generation_count, cfg.limits.max_ai_generations);
    }

    #[test]
    fn unreachable_store_fails_open_with_reason() {
        let cfg = baseline_config();
        let decision = check_ai_generation(&UnavailableStore, &cfg, &visitor(), 1_000);
        assert!(decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("degraded_store"));

        let decision = try_admit_session_creation(&UnavailableStore, &cfg, &visitor(), "s1", 1_000);
        assert!(decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("degraded_store"));
    }

    #[test]
    fn concurrent_project_creations_never_exceed_the_session_cap() {
        use crate::session::{session_key, DemoSession};
        use crate::store::{get_json, set_json};

        let store = Arc::new(MemoryStore::default());
        let cfg = Arc::new(baseline_config()); // 3 projects per session
        let session = DemoSession::stub_for_tests("s-project-race", "fp", 1_000);
        set_json(store.as_ref(), &session_key("s-project-race"), &session).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let cfg = Arc::clone(&cfg);
                thread::spawn(move || {
                    let mut admitted = 0u32;
                    for _ in 0..5 {
                        if let Some(decision) =
                            try_admit_project_creation(store.as_ref(), &cfg, "s-project-race")
                        {
                            if decision.allowed {
                                admitted += 1;
                            }
                        }
                    }
                    admitted
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, cfg.limits.max_projects_per_session);
        let after: DemoSession = get_json(store.as_ref(), &session_key("s-project-race"))
            .unwrap()
            .unwrap();
        assert_eq!(after.projects_created, cfg.limits.max_projects_per_session);
    }

    #[test]
    fn project_admission_reports_a_vanished_session() {
        let store = MemoryStore::default();
        let cfg = baseline_config();
        assert!(try_admit_project_creation(&store, &cfg, "s-gone").is_none());
    }

    #[test]
    fn project_cap_is_per_session() {
        let cfg = baseline_config(); // 3 projects per session
        let mut session = crate::session::DemoSession::stub_for_tests("s1", "fp", 1_000);
        for _ in 0..3 {
            assert!(check_project_creation(&session, &cfg).allowed);
            session.projects_created += 1;
        }
        let denied = check_project_creation(&session, &cfg);
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some("project_session_cap"));
    }
}
