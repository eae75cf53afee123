// src/observability/metrics.rs
// KV-backed counters exported in Prometheus text format. Increments go
// straight to the store as read-modify-write; a failed write is logged
// and dropped rather than retried on the request path.

use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::store::KeyValueStore;

const METRICS_PREFIX: &str = "metrics:";

const DENIAL_REASONS: [&str; 8] = [
    "visitor_blocked",
    "session_lifetime_cap",
    "session_rate_hourly",
    "session_rate_daily",
    "ai_lifetime_cap",
    "ai_window_cap",
    "project_session_cap",
    "high_risk",
];

#[derive(Debug, Clone, Copy)]
pub enum MetricName {
    RequestsTotal,
    SessionsCreatedTotal,
    AdmissionDeniedTotal,
    AiGenerationsTotal,
    ProjectsCreatedTotal,
    ExportsTotal,
    ExtensionsGrantedTotal,
    SessionResetsTotal,
    SessionsReconciledTotal,
    ContentDeletedTotal,
    BoardsResetTotal,
    ReconcileFailuresTotal,
    StoreOutagesTotal,
}

impl MetricName {
    fn as_str(&self) -> &'static str {
        match self {
            MetricName::RequestsTotal => "requests_total",
            MetricName::SessionsCreatedTotal => "sessions_created_total",
            MetricName::AdmissionDeniedTotal => "admission_denied_total",
            MetricName::AiGenerationsTotal => "ai_generations_total",
            MetricName::ProjectsCreatedTotal => "projects_created_total",
            MetricName::ExportsTotal => "exports_total",
            MetricName::ExtensionsGrantedTotal => "extensions_granted_total",
            MetricName::SessionResetsTotal => "session_resets_total",
            MetricName::SessionsReconciledTotal => "sessions_reconciled_total",
            MetricName::ContentDeletedTotal => "content_deleted_total",
            MetricName::BoardsResetTotal => "boards_reset_total",
            MetricName::ReconcileFailuresTotal => "reconcile_failures_total",
            MetricName::StoreOutagesTotal => "store_outages_total",
        }
    }
}

fn metric_key(metric: MetricName, label: Option<&str>) -> String {
    match label {
        Some(l) => format!("{}{}:{}", METRICS_PREFIX, metric.as_str(), l),
        None => format!("{}{}", METRICS_PREFIX, metric.as_str()),
    }
}

/// Increment a counter, optionally labelled. Never fails the caller.
pub fn increment<S: KeyValueStore>(store: &S, metric: MetricName, label: Option<&str>) {
    increment_by(store, metric, label, 1);
}

// Counter updates are read-modify-write; one lock covers them all so
// concurrent requests in this instance cannot drop increments.
static COUNTER_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn increment_by<S: KeyValueStore>(
    store: &S,
    metric: MetricName,
    label: Option<&str>,
    delta: u64,
) {
    if delta == 0 {
        return;
    }
    let key = metric_key(metric, label);
    let _guard = COUNTER_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let current = read_counter(store, &key);
    let updated = current.saturating_add(delta);
    if store.set(&key, updated.to_string().as_bytes()).is_err() {
        eprintln!("[metrics] failed to write metric {} -> {}", key, updated);
    }
}

fn read_counter<S: KeyValueStore>(store: &S, key: &str) -> u64 {
    store
        .get(key)
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

pub fn counter_value<S: KeyValueStore>(
    store: &S,
    metric: MetricName,
    label: Option<&str>,
) -> u64 {
    read_counter(store, &metric_key(metric, label))
}

fn count_live_sessions<S: KeyValueStore>(store: &S) -> u64 {
    store
        .get_keys()
        .map(|keys| keys.iter().filter(|k| k.starts_with("session:")).count() as u64)
        .unwrap_or(0)
}

/// Prometheus text exposition for GET /metrics.
pub fn render_metrics<S: KeyValueStore>(store: &S) -> String {
    let mut output = String::new();
    output.push_str("# Demo Warden Metrics\n");

    let plain_counters: [(MetricName, &str); 8] = [
        (MetricName::RequestsTotal, "Total handled requests"),
        (MetricName::SessionsCreatedTotal, "Demo sessions created"),
        (MetricName::AiGenerationsTotal, "AI generations admitted"),
        (MetricName::ProjectsCreatedTotal, "Projects created"),
        (MetricName::ExportsTotal, "Export attempts recorded"),
        (MetricName::ExtensionsGrantedTotal, "Session extensions granted"),
        (MetricName::SessionResetsTotal, "Session resets performed"),
        (MetricName::StoreOutagesTotal, "Requests served in degraded (fail-open) mode"),
    ];
    for (metric, help) in plain_counters {
        output.push_str(&format!(
            "\n# TYPE demo_warden_{} counter\n# HELP demo_warden_{} {}\n",
            metric.as_str(),
            metric.as_str(),
            help
        ));
        output.push_str(&format!(
            "demo_warden_{} {}\n",
            metric.as_str(),
            read_counter(store, &metric_key(metric, None))
        ));
    }

    output.push_str("\n# TYPE demo_warden_admission_denied_total counter\n");
    output.push_str("# HELP demo_warden_admission_denied_total Denied admissions by reason\n");
    for reason in DENIAL_REASONS {
        let count = read_counter(
            store,
            &metric_key(MetricName::AdmissionDeniedTotal, Some(reason)),
        );
        output.push_str(&format!(
            "demo_warden_admission_denied_total{{reason=\"{}\"}} {}\n",
            reason, count
        ));
    }

    let reconcile_counters: [(MetricName, &str); 3] = [
        (MetricName::SessionsReconciledTotal, "Expired sessions reconciled"),
        (MetricName::ContentDeletedTotal, "Content records deleted by reconciliation"),
        (MetricName::ReconcileFailuresTotal, "Sessions skipped by reconciliation after errors"),
    ];
    for (metric, help) in reconcile_counters {
        output.push_str(&format!(
            "\n# TYPE demo_warden_{} counter\n# HELP demo_warden_{} {}\n",
            metric.as_str(),
            metric.as_str(),
            help
        ));
        output.push_str(&format!(
            "demo_warden_{} {}\n",
            metric.as_str(),
            read_counter(store, &metric_key(metric, None))
        ));
    }

    output.push_str("\n# TYPE demo_warden_boards_reset_total counter\n");
    output.push_str(&format!(
        "demo_warden_boards_reset_total {}\n",
        read_counter(store, &metric_key(MetricName::BoardsResetTotal, None))
    ));

    output.push_str("\n# TYPE demo_warden_live_sessions gauge\n");
    output.push_str("# HELP demo_warden_live_sessions Session records currently stored\n");
    output.push_str(&format!(
        "demo_warden_live_sessions {}\n",
        count_live_sessions(store)
    ));

    output
}
