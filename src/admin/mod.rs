// src/admin/mod.rs
// Operator surface: bearer-token guarded visitor actions, ledger and
// event inspection, and the manual reconcile trigger. The insecure
// placeholder key never authorizes anything.

use serde::Deserialize;
use spin_sdk::http::{Method, Request, Response};

use crate::config::Config;
use crate::ledger::{self, VisitorId};
use crate::observability::events::{self, EventLogEntry, EventType};
use crate::reconcile;
use crate::runtime::{error_response, json_response};
use crate::store::KeyValueStore;

const INSECURE_DEFAULT_API_KEY: &str = "changeme-supersecret";

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn configured_api_key() -> Option<String> {
    let key = crate::config::api_key()?;
    let key = key.trim().to_string();
    if key.is_empty() || key == INSECURE_DEFAULT_API_KEY {
        return None;
    }
    Some(key)
}

fn bearer_token(req: &Request) -> Option<String> {
    let header = req.header("authorization")?.as_str()?;
    let prefix = "Bearer ";
    if !header.starts_with(prefix) {
        return None;
    }
    Some(header[prefix.len()..].trim().to_string())
}

pub fn is_bearer_authorized(req: &Request) -> bool {
    let Some(expected) = configured_api_key() else {
        return false;
    };
    match bearer_token(req) {
        Some(candidate) => constant_time_eq(&candidate, &expected),
        None => false,
    }
}

#[derive(Debug, Deserialize)]
struct VisitorActionBody {
    address: String,
    fingerprint: String,
    #[serde(default)]
    reason: Option<String>,
}

fn parse_visitor_body(req: &Request) -> Option<VisitorActionBody> {
    serde_json::from_slice::<VisitorActionBody>(req.body()).ok()
}

fn query_param(req: &Request, name: &str) -> Option<String> {
    let query = req.query();
    for pair in query.split('&') {
        let mut kv = pair.splitn(2, '=');
        let k = kv.next()?;
        if k == name {
            let v = kv.next().unwrap_or("");
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

fn audit_admin_action<S: KeyValueStore>(
    store: &S,
    now: u64,
    event: EventType,
    body: &VisitorActionBody,
    outcome: &str,
) {
    events::log_event(
        store,
        &EventLogEntry {
            ts: now,
            event,
            network_address: Some(body.address.clone()),
            fingerprint: Some(body.fingerprint.clone()),
            session_id: None,
            reason: body.reason.clone(),
            outcome: Some(outcome.to_string()),
        },
    );
}

fn handle_visitor_action<S: KeyValueStore>(
    store: &S,
    req: &Request,
    action: &str,
    now: u64,
) -> Response {
    let Some(body) = parse_visitor_body(req) else {
        return error_response(400, "expected JSON body with address and fingerprint");
    };
    let visitor = VisitorId::new(&body.address, &body.fingerprint);

    let (result, event) = match action {
        "flag" => {
            let reason = body.reason.as_deref().unwrap_or("flagged by operator");
            (
                ledger::flag(store, &visitor, reason, now),
                EventType::VisitorFlagged,
            )
        }
        "block" => {
            let reason = body.reason.as_deref().unwrap_or("blocked by operator");
            (
                ledger::block(store, &visitor, reason, now),
                EventType::VisitorBlocked,
            )
        }
        "unblock" => (
            ledger::unblock(store, &visitor, now),
            EventType::VisitorUnblocked,
        ),
        "reset" => (
            ledger::reset_counters(store, &visitor, now),
            EventType::AdminAction,
        ),
        _ => return error_response(404, "unknown visitor action"),
    };

    match result {
        Ok(()) => {
            audit_admin_action(store, now, event, &body, action);
            json_response(200, &serde_json::json!({ "ok": true, "action": action }))
        }
        Err(()) => error_response(503, "ledger store unavailable"),
    }
}

fn handle_ledger_lookup<S: KeyValueStore>(store: &S, req: &Request) -> Response {
    let (Some(address), Some(fingerprint)) =
        (query_param(req, "address"), query_param(req, "fingerprint"))
    else {
        return error_response(400, "address and fingerprint query params required");
    };
    let visitor = VisitorId::new(&address, &fingerprint);
    match ledger::read_record(store, &visitor) {
        Ok(Some(record)) => json_response(200, &record),
        Ok(None) => error_response(404, "no ledger record for visitor"),
        Err(()) => error_response(503, "ledger store unavailable"),
    }
}

fn handle_events<S: KeyValueStore>(store: &S, req: &Request, now: u64) -> Response {
    let hours = query_param(req, "hours")
        .and_then(|h| h.parse::<u64>().ok())
        .unwrap_or(24);
    match events::load_recent(store, now, hours) {
        Ok(entries) => json_response(200, &entries),
        Err(()) => error_response(503, "event store unavailable"),
    }
}

fn handle_reconcile<S: KeyValueStore>(store: &S, cfg: &Config, now: u64) -> Response {
    match reconcile::run_with_now(store, cfg, now) {
        Ok(summary) => json_response(
            200,
            &serde_json::json!({
                "sessions_examined": summary.sessions_examined,
                "sessions_reconciled": summary.sessions_reconciled,
                "content_deleted": summary.content_deleted,
                "boards_reset": summary.boards_reset,
                "failures": summary.failures,
            }),
        ),
        Err(()) => error_response(503, "session store unavailable"),
    }
}

/// Dispatch for paths under /admin. Auth happens here, once.
pub fn handle<S: KeyValueStore>(
    store: &S,
    cfg: &Config,
    req: &Request,
    path: &str,
    now: u64,
) -> Response {
    if configured_api_key().is_none() {
        eprintln!("[admin] WARDEN_API_KEY missing or left at the insecure default; admin surface disabled");
        return error_response(503, "admin API key not configured");
    }
    if !is_bearer_authorized(req) {
        return error_response(401, "unauthorized");
    }

    let method = req.method();
    match (method, path) {
        (Method::Post, "/admin/visitor/flag") => handle_visitor_action(store, req, "flag", now),
        (Method::Post, "/admin/visitor/block") => handle_visitor_action(store, req, "block", now),
        (Method::Post, "/admin/visitor/unblock") => {
            handle_visitor_action(store, req, "unblock", now)
        }
        (Method::Post, "/admin/visitor/reset") => handle_visitor_action(store, req, "reset", now),
        (Method::Get, "/admin/ledger") => handle_ledger_lookup(store, req),
        (Method::Get, "/admin/events") => handle_events(store, req, now),
        (Method::Post, "/admin/reconcile") => handle_reconcile(store, cfg, now),
        _ => error_response(404, "not found"),
    }
}
