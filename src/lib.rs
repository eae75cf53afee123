// src/lib.rs
// Entry point for the Demo Warden Spin component: demo-mode abuse
// prevention (fingerprinting, network risk scoring, admission control,
// session lifecycle, reconciliation) over the Spin key-value store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use spin_sdk::http::{Request, Response};
#[cfg(target_arch = "wasm32")]
use spin_sdk::http_component;
use spin_sdk::key_value::Store;

pub mod admin;
pub mod admission;
pub mod config;
pub mod content;
pub mod ledger;
pub mod observability;
pub mod reconcile;
pub mod runtime;
pub mod session;
pub mod signals;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

use crate::signals::reputation::HttpReputationBackend;
use crate::store::UnavailableStore;

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Forwarded IP headers are trusted only when the proxy proves itself;
/// with no secret configured every header is trusted (single-hop
/// deployments behind a managed gateway).
fn forwarded_ip_trusted(req: &Request) -> bool {
    match config::forwarded_ip_secret() {
        Some(secret) => req
            .header("x-warden-forwarded-secret")
            .and_then(|v| v.as_str())
            .map(|v| v == secret)
            .unwrap_or(false),
        None => true,
    }
}

/// Best available client address. An unresolvable address is not an
/// error here; the risk scorer treats it as maximum risk downstream.
pub(crate) fn extract_client_ip(req: &Request) -> String {
    if forwarded_ip_trusted(req) {
        if let Some(h) = req.header("x-forwarded-for") {
            let val = h.as_str().unwrap_or("");
            if let Some(ip) = val.split(',').next() {
                let ip = ip.trim();
                if !ip.is_empty() && ip != "unknown" {
                    return ip.to_string();
                }
            }
        }
        if let Some(h) = req.header("x-real-ip") {
            let val = h.as_str().unwrap_or("");
            if !val.is_empty() && val != "unknown" {
                return val.to_string();
            }
        }
    }
    "unknown".to_string()
}

static OFFICIAL_BOARD_SEEDED: AtomicBool = AtomicBool::new(false);

/// Main handler logic, testable as a plain Rust function.
pub fn handle_request_impl(req: &Request) -> Response {
    let cfg = match config::loaded() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("[LIMITS] fatal configuration error: {}", err.message());
            return runtime::error_response(500, "configuration error");
        }
    };

    let client_ip = extract_client_ip(req);
    let now = now_ts();
    let backend = HttpReputationBackend::from_config(cfg);

    match Store::open_default() {
        Ok(store) => {
            if !OFFICIAL_BOARD_SEEDED.swap(true, Ordering::SeqCst)
                && runtime::request_router::ensure_official_board(&store).is_err()
            {
                eprintln!("[KV OUTAGE] could not seed the official demo board");
            }
            runtime::request_router::route(&store, cfg, backend.as_ref(), req, &client_ip, now)
        }
        Err(_) => {
            eprintln!("[KV OUTAGE] default store unavailable; serving fail-open decisions");
            runtime::request_router::route(
                &UnavailableStore,
                cfg,
                backend.as_ref(),
                req,
                &client_ip,
                now,
            )
        }
    }
}

#[cfg(target_arch = "wasm32")]
#[http_component]
pub fn spin_entrypoint(req: Request) -> Response {
    handle_request_impl(&req)
}
