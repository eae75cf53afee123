// src/signals/reputation.rs
// Optional remote reputation enrichment. One GET per uncached address,
// result cached in KV by address hash for a bounded TTL. Any failure
// degrades silently to the local-only assessment; this lookup sits on
// the request path and must never become fatal.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::signals::ip_risk::RiskAssessment;
use crate::store::{get_json, set_json, KeyValueStore};

const REMOTE_VPN_SCORE: u8 = 55;
const REMOTE_PROXY_SCORE: u8 = 50;
const REMOTE_DATACENTER_SCORE: u8 = 45;
const REMOTE_ABUSE_WEIGHT_CAP: u8 = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReputation {
    #[serde(default)]
    pub is_vpn: bool,
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default)]
    pub is_datacenter: bool,
    #[serde(default)]
    pub abuse_score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedReputation {
    fetched_at: u64,
    reputation: RemoteReputation,
}

pub trait ReputationBackend {
    fn lookup(&self, address: &str) -> Result<RemoteReputation, String>;
}

/// Concrete backend hitting the configured reputation API over Spin's
/// outbound HTTP. The runtime enforces the outbound timeout; we make a
/// single attempt and treat every failure the same way.
pub struct HttpReputationBackend {
    url: String,
    api_key: Option<String>,
}

impl HttpReputationBackend {
    pub fn from_config(cfg: &Config) -> Option<Self> {
        cfg.reputation_api_url.as_ref().map(|url| HttpReputationBackend {
            url: url.clone(),
            api_key: cfg.reputation_api_key.clone(),
        })
    }
}

impl ReputationBackend for HttpReputationBackend {
    fn lookup(&self, address: &str) -> Result<RemoteReputation, String> {
        use spin_sdk::http::{Method, Request, Response};

        let mut builder = Request::builder();
        builder
            .method(Method::Get)
            .uri(format!("{}?address={}", self.url, address));
        if let Some(key) = &self.api_key {
            builder.header("authorization", format!("Bearer {}", key));
        }
        let request = builder.build();

        let response: Response = spin_sdk::http::run(async move {
            spin_sdk::http::send(request).await
        })
        .map_err(|err| format!("reputation request failed ({:?})", err))?;

        if *response.status() != 200 {
            return Err(format!(
                "reputation service returned status {}",
                response.status()
            ));
        }
        serde_json::from_slice::<RemoteReputation>(response.body())
            .map_err(|_| "reputation response was not valid JSON".to_string())
    }
}

fn cache_key(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("reputation:{}", hex)
}

fn cached_lookup_with_now<S: KeyValueStore, B: ReputationBackend>(
    store: &S,
    backend: &B,
    address: &str,
    cache_ttl_seconds: u64,
    now: u64,
) -> Option<RemoteReputation> {
    let key = cache_key(address);
    if let Ok(Some(cached)) = get_json::<S, CachedReputation>(store, &key) {
        if now.saturating_sub(cached.fetched_at) <= cache_ttl_seconds {
            return Some(cached.reputation);
        }
    }

    match backend.lookup(address) {
        Ok(reputation) => {
            let entry = CachedReputation {
                fetched_at: now,
                reputation: reputation.clone(),
            };
            if set_json(store, &key, &entry).is_err() {
                eprintln!("[reputation] failed caching result for key {}", key);
            }
            Some(reputation)
        }
        Err(err) => {
            eprintln!(
                "[reputation] remote lookup failed for {} ({}); using local score only",
                address, err
            );
            None
        }
    }
}

/// Layer the remote verdict onto a local assessment. Factors only add;
/// remote disagreement never lowers the local score.
pub fn enrich_with_backend<S: KeyValueStore, B: ReputationBackend>(
    store: &S,
    backend: Option<&B>,
    cfg: &Config,
    address: &str,
    mut assessment: RiskAssessment,
    now: u64,
) -> RiskAssessment {
    let Some(backend) = backend else {
        return assessment;
    };
    let Some(remote) =
        cached_lookup_with_now(store, backend, address, cfg.reputation_cache_ttl_seconds, now)
    else {
        return assessment;
    };

    if remote.is_vpn && !assessment.is_vpn {
        assessment.is_vpn = true;
        assessment.add(REMOTE_VPN_SCORE, "remote:vpn".to_string());
    }
    if remote.is_proxy && !assessment.is_proxy {
        assessment.is_proxy = true;
        assessment.add(REMOTE_PROXY_SCORE, "remote:proxy".to_string());
    }
    if remote.is_datacenter && !assessment.is_datacenter {
        assessment.is_datacenter = true;
        assessment.add(REMOTE_DATACENTER_SCORE, "remote:datacenter".to_string());
    }
    if remote.abuse_score > 0 {
        let points = remote.abuse_score.min(REMOTE_ABUSE_WEIGHT_CAP);
        assessment.add(points, format!("remote:abuse_score:{}", remote.abuse_score));
    }

    assessment
}
