// src/runtime/request_router.rs
// Maps the HTTP surface onto the core modules. The router only ever
// consumes extracted strings (client address, headers, JSON bodies);
// admission and session semantics live in their own modules.

use serde::Deserialize;
use spin_sdk::http::{Method, Request, Response};

use crate::admin;
use crate::admission;
use crate::config::Config;
use crate::content;
use crate::ledger::{self, VisitorId};
use crate::observability::events::{self, EventLogEntry, EventType};
use crate::observability::metrics::{self, MetricName};
use crate::reconcile;
use crate::runtime::{error_response, json_response, text_response};
use crate::session::{self, DemoMode, SessionState};
use crate::signals::fingerprint::{self, ClientSignals};
use crate::signals::ip_risk;
use crate::signals::reputation::{self, ReputationBackend};
use crate::store::KeyValueStore;

const SESSION_HEADER: &str = "x-demo-session";

fn header_string(req: &Request, name: &str) -> String {
    req.header(name)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn client_signals(req: &Request) -> ClientSignals {
    ClientSignals {
        user_agent: header_string(req, "user-agent"),
        accept_language: header_string(req, "accept-language"),
        accept_encoding: header_string(req, "accept-encoding"),
    }
}

fn store_unavailable(context: &str) -> Response {
    eprintln!("[KV OUTAGE] store unavailable during {}", context);
    error_response(503, "storage unavailable")
}

#[derive(Debug, Deserialize, Default)]
struct EnterBody {
    #[serde(default)]
    mode: Option<String>,
}

fn denial_response<S: KeyValueStore>(
    store: &S,
    decision: &admission::Decision,
    status: u16,
) -> Response {
    if let Some(reason) = decision.reason.as_deref() {
        metrics::increment(store, MetricName::AdmissionDeniedTotal, Some(reason));
    }
    json_response(
        status,
        &serde_json::json!({
            "allowed": false,
            "reason": decision.reason,
            "wait_seconds": decision.wait_seconds,
        }),
    )
}

fn handle_enter<S: KeyValueStore, B: ReputationBackend>(
    store: &S,
    cfg: &Config,
    backend: Option<&B>,
    req: &Request,
    client_ip: &str,
    now: u64,
) -> Response {
    let signals = client_signals(req);
    let fp = fingerprint::derive(&signals);
    let visitor = VisitorId::new(client_ip, &fp);

    let assessment = ip_risk::assess_local(client_ip);
    let assessment =
        reputation::enrich_with_backend(store, backend, cfg, client_ip, assessment, now);

    if assessment.score >= cfg.risk_block_threshold {
        metrics::increment(store, MetricName::AdmissionDeniedTotal, Some("high_risk"));
        events::log_event(
            store,
            &EventLogEntry {
                ts: now,
                event: EventType::SessionDenied,
                network_address: Some(client_ip.to_string()),
                fingerprint: Some(fp.clone()),
                session_id: None,
                reason: Some(format!("high_risk:{}", assessment.factors.join(","))),
                outcome: Some("denied".to_string()),
            },
        );
        return json_response(
            403,
            &serde_json::json!({
                "allowed": false,
                "reason": "high_risk",
            }),
        );
    }

    if assessment.reduces_ceilings() && ledger::mark_vpn_user(store, &visitor, now).is_err() {
        eprintln!("[KV OUTAGE] could not persist vpn flag for {}", client_ip);
    }

    let session_id = session::new_session_id();
    let decision = admission::try_admit_session_creation(store, cfg, &visitor, &session_id, now);
    if !decision.allowed {
        events::log_event(
            store,
            &EventLogEntry {
                ts: now,
                event: EventType::SessionDenied,
                network_address: Some(client_ip.to_string()),
                fingerprint: Some(fp),
                session_id: None,
                reason: decision.reason.clone(),
                outcome: Some("denied".to_string()),
            },
        );
        return denial_response(store, &decision, 429);
    }

    let mode = serde_json::from_slice::<EnterBody>(req.body())
        .ok()
        .and_then(|b| b.mode)
        .and_then(|m| DemoMode::parse(&m))
        .unwrap_or(DemoMode::Solo);

    let session = match session::create_with_id(store, cfg, &visitor, mode, &session_id, now) {
        Ok(session) => session,
        Err(()) => return store_unavailable("session creation"),
    };

    if decision.reason.as_deref() == Some("degraded_store") {
        metrics::increment(store, MetricName::StoreOutagesTotal, None);
    }
    metrics::increment(store, MetricName::SessionsCreatedTotal, None);
    events::log_event(
        store,
        &EventLogEntry {
            ts: now,
            event: EventType::SessionCreated,
            network_address: Some(client_ip.to_string()),
            fingerprint: Some(session.fingerprint.clone()),
            session_id: Some(session.session_id.clone()),
            reason: None,
            outcome: Some("created".to_string()),
        },
    );

    json_response(
        201,
        &serde_json::json!({
            "session_id": session.session_id,
            "mode": session.mode,
            "expires_at": session.expires_at,
            "first_demo_start": session.first_demo_start,
            "risk": {
                "score": assessment.score,
                "suspicious": assessment.score >= cfg.risk_suspicious_threshold,
                "reduced_ceilings": assessment.reduces_ceilings(),
            },
            "degraded": decision.reason.as_deref() == Some("degraded_store"),
        }),
    )
}

/// Resolve the x-demo-session header to an active session, or the
/// response that ends the request.
fn require_active_session<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    req: &Request,
    now: u64,
) -> Result<session::DemoSession, Response> {
    let session_id = header_string(req, SESSION_HEADER);
    if session_id.is_empty() {
        return Err(error_response(400, "x-demo-session header required"));
    }
    match session::lookup(store, cfg, &session_id, now) {
        Ok(SessionState::Active { session, .. }) => Ok(session),
        Ok(SessionState::Expired(_)) => Err(json_response(
            410,
            &serde_json::json!({ "status": "expired" }),
        )),
        Ok(SessionState::Absent) => Err(json_response(
            404,
            &serde_json::json!({ "status": "absent" }),
        )),
        Err(()) => Err(store_unavailable("session lookup")),
    }
}

fn session_visitor(session: &session::DemoSession) -> VisitorId {
    VisitorId::new(&session.network_address, &session.fingerprint)
}

fn handle_status<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    req: &Request,
    now: u64,
) -> Response {
    let session_id = header_string(req, SESSION_HEADER);
    if session_id.is_empty() {
        return error_response(400, "x-demo-session header required");
    }
    match session::lookup(store, cfg, &session_id, now) {
        Ok(SessionState::Active {
            session,
            expiring_soon,
        }) => json_response(
            200,
            &serde_json::json!({
                "status": "active",
                "mode": session.mode,
                "expires_at": session.expires_at,
                "seconds_remaining": session.seconds_remaining(now),
                "expiring_soon": expiring_soon,
                "ai_generations_used": session.ai_generations_used,
                "projects_created": session.projects_created,
                "export_attempts": session.export_attempts,
                "limitations_hit": session.limitations_hit,
                "reset_count": session.reset_count,
            }),
        ),
        Ok(SessionState::Expired(_)) => {
            json_response(410, &serde_json::json!({ "status": "expired" }))
        }
        Ok(SessionState::Absent) => json_response(404, &serde_json::json!({ "status": "absent" })),
        Err(()) => store_unavailable("session lookup"),
    }
}

fn handle_extend<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    req: &Request,
    now: u64,
) -> Response {
    let session = match require_active_session(store, cfg, req, now) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    let visitor = session_visitor(&session);
    match session::extend(store, cfg, &visitor, &session.session_id, now) {
        Ok(session::ExtendOutcome::Extended { expires_at }) => {
            metrics::increment(store, MetricName::ExtensionsGrantedTotal, None);
            events::log_event(
                store,
                &EventLogEntry {
                    ts: now,
                    event: EventType::SessionExtended,
                    network_address: Some(session.network_address.clone()),
                    fingerprint: Some(session.fingerprint.clone()),
                    session_id: Some(session.session_id.clone()),
                    reason: None,
                    outcome: Some(format!("expires_at={}", expires_at)),
                },
            );
            json_response(
                200,
                &serde_json::json!({ "extended": true, "expires_at": expires_at }),
            )
        }
        Ok(session::ExtendOutcome::ExtensionsExhausted) => {
            let _ = session::record_limitation(store, &session.session_id, "extensions_exhausted");
            json_response(
                429,
                &serde_json::json!({ "extended": false, "reason": "extensions_exhausted" }),
            )
        }
        Ok(session::ExtendOutcome::SessionGone) => {
            json_response(410, &serde_json::json!({ "status": "expired" }))
        }
        Err(()) => store_unavailable("session extension"),
    }
}

fn handle_reset<S: KeyValueStore>(store: &S, cfg: &Config, req: &Request, now: u64) -> Response {
    let session = match require_active_session(store, cfg, req, now) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    match session::reset(store, &session.session_id) {
        Ok(Some(after)) => {
            metrics::increment(store, MetricName::SessionResetsTotal, None);
            events::log_event(
                store,
                &EventLogEntry {
                    ts: now,
                    event: EventType::SessionReset,
                    network_address: Some(session.network_address.clone()),
                    fingerprint: Some(session.fingerprint.clone()),
                    session_id: Some(session.session_id.clone()),
                    reason: None,
                    outcome: Some(format!("reset_count={}", after.reset_count)),
                },
            );
            json_response(
                200,
                &serde_json::json!({
                    "reset": true,
                    "reset_count": after.reset_count,
                    "expires_at": after.expires_at,
                }),
            )
        }
        Ok(None) => json_response(404, &serde_json::json!({ "status": "absent" })),
        Err(()) => store_unavailable("session reset"),
    }
}

fn handle_ai<S: KeyValueStore>(store: &S, cfg: &Config, req: &Request, now: u64) -> Response {
    let session = match require_active_session(store, cfg, req, now) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    let visitor = session_visitor(&session);
    let decision = admission::try_admit_ai_generation(store, cfg, &visitor, now);
    if !decision.allowed {
        if let Some(reason) = decision.reason.as_deref() {
            let _ = session::record_limitation(store, &session.session_id, reason);
        }
        events::log_event(
            store,
            &EventLogEntry {
                ts: now,
                event: EventType::AiDenied,
                network_address: Some(session.network_address.clone()),
                fingerprint: Some(session.fingerprint.clone()),
                session_id: Some(session.session_id.clone()),
                reason: decision.reason.clone(),
                outcome: Some("denied".to_string()),
            },
        );
        return denial_response(store, &decision, 429);
    }

    if session::record_ai_use(store, &session.session_id).is_err() {
        eprintln!("[KV OUTAGE] admitted AI call not recorded on session");
    }
    if decision.reason.as_deref() == Some("degraded_store") {
        metrics::increment(store, MetricName::StoreOutagesTotal, None);
    }
    metrics::increment(store, MetricName::AiGenerationsTotal, None);
    json_response(
        200,
        &serde_json::json!({
            "allowed": true,
            "degraded": decision.reason.as_deref() == Some("degraded_store"),
        }),
    )
}

fn handle_project<S: KeyValueStore>(store: &S, cfg: &Config, req: &Request, now: u64) -> Response {
    let session = match require_active_session(store, cfg, req, now) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    // Cap check and increment happen inside one session write; a second
    // tab racing this request cannot both pass the check.
    let decision = match admission::try_admit_project_creation(store, cfg, &session.session_id) {
        Some(decision) => decision,
        None => return json_response(410, &serde_json::json!({ "status": "expired" })),
    };
    if !decision.allowed {
        if let Some(reason) = decision.reason.as_deref() {
            let _ = session::record_limitation(store, &session.session_id, reason);
        }
        return denial_response(store, &decision, 429);
    }

    let visitor = session_visitor(&session);
    if admission::record_project_creation(store, &visitor, now).is_err() {
        eprintln!("[KV OUTAGE] project creation not recorded on ledger");
    }
    metrics::increment(store, MetricName::ProjectsCreatedTotal, None);
    json_response(200, &serde_json::json!({ "allowed": true }))
}

fn handle_export<S: KeyValueStore>(store: &S, cfg: &Config, req: &Request, now: u64) -> Response {
    let session = match require_active_session(store, cfg, req, now) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    if session::record_export(store, &session.session_id).is_err() {
        return store_unavailable("export recording");
    }
    metrics::increment(store, MetricName::ExportsTotal, None);
    json_response(200, &serde_json::json!({ "recorded": true }))
}

fn handle_health<S: KeyValueStore>(store: &S) -> Response {
    match store.get("health:probe") {
        Ok(_) => json_response(
            200,
            &serde_json::json!({
                "status": "ok",
                "catalog_version": ip_risk::catalog_version(),
            }),
        ),
        Err(()) => json_response(
            503,
            &serde_json::json!({ "status": "degraded", "store": "unavailable" }),
        ),
    }
}

/// Top-level dispatch. `client_ip` arrives already extracted and
/// trust-checked by the entrypoint.
pub fn route<S: KeyValueStore, B: ReputationBackend>(
    store: &S,
    cfg: &Config,
    backend: Option<&B>,
    req: &Request,
    client_ip: &str,
    now: u64,
) -> Response {
    metrics::increment(store, MetricName::RequestsTotal, None);

    // Background upkeep rides on request traffic; both are latched to
    // at most once per interval.
    events::maybe_cleanup(store, now, cfg.event_log_retention_hours);
    reconcile::maybe_run_with_now(store, cfg, now);

    let path = req.path();
    if path.starts_with("/admin") {
        return admin::handle(store, cfg, req, path, now);
    }

    match (req.method(), path) {
        (Method::Get, "/health") => handle_health(store),
        (Method::Get, "/metrics") => text_response(
            200,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics::render_metrics(store),
        ),
        (Method::Post, "/demo/enter") => handle_enter(store, cfg, backend, req, client_ip, now),
        (Method::Get, "/demo/status") => handle_status(store, cfg, req, now),
        (Method::Post, "/demo/extend") => handle_extend(store, cfg, req, now),
        (Method::Post, "/demo/reset") => handle_reset(store, cfg, req, now),
        (Method::Post, "/demo/ai") => handle_ai(store, cfg, req, now),
        (Method::Post, "/demo/project") => handle_project(store, cfg, req, now),
        (Method::Post, "/demo/export") => handle_export(store, cfg, req, now),
        _ => error_response(404, "not found"),
    }
}

// Seeding hook for deployments that want the official demo board
// present before the first reconcile pass.
pub fn ensure_official_board<S: KeyValueStore>(store: &S) -> Result<(), ()> {
    if !content::official_boards(store)?.is_empty() {
        return Ok(());
    }
    content::put_board(
        store,
        &content::BoardRecord {
            id: "welcome".to_string(),
            tag: "seed".to_string(),
            official: true,
            name: "Welcome to the demo".to_string(),
            columns: vec![
                content::BoardColumn {
                    name: "todo".to_string(),
                    terminal: false,
                },
                content::BoardColumn {
                    name: "in_progress".to_string(),
                    terminal: false,
                },
                content::BoardColumn {
                    name: "done".to_string(),
                    terminal: true,
                },
            ],
        },
    )
}
