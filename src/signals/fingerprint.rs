// src/signals/fingerprint.rs
// Coarse visitor fingerprint derived from client-supplied request
// signals. Deliberately excludes cookies, IPs, and timestamps: the
// value must survive cookie clears and private windows, and identical
// signal sets are *meant* to collide.

use sha2::{Digest, Sha256};

/// Client signals as extracted by the HTTP layer. Absent headers are
/// empty strings; they still hash deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSignals {
    pub user_agent: String,
    pub accept_language: String,
    pub accept_encoding: String,
}

impl ClientSignals {
    pub fn new(user_agent: &str, accept_language: &str, accept_encoding: &str) -> Self {
        ClientSignals {
            user_agent: user_agent.to_string(),
            accept_language: accept_language.to_string(),
            accept_encoding: accept_encoding.to_string(),
        }
    }
}

/// Derive the visitor fingerprint: a fixed-length hex digest over the
/// signal fields with an unambiguous separator.
pub fn derive(signals: &ClientSignals) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signals.user_agent.as_bytes());
    hasher.update([0u8]);
    hasher.update(signals.accept_language.as_bytes());
    hasher.update([0u8]);
    hasher.update(signals.accept_encoding.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
