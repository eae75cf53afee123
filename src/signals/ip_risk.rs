// src/signals/ip_risk.rs
// Local network-origin risk scoring. Classifies an address against the
// embedded datacenter/VPN/proxy CIDR catalog and flags reserved ranges.
// Scoring is monotonic: factors only ever add.

use ipnet::IpNet;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::net::IpAddr;

const DATACENTER_RANGES_TEXT: &str = include_str!("../../config/datacenter_ranges.json");

pub const SCORE_MAX: u8 = 100;
const SCORE_DATACENTER: u8 = 45;
const SCORE_VPN: u8 = 55;
const SCORE_PROXY: u8 = 50;
const SCORE_RESERVED: u8 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeClassification {
    Datacenter,
    Vpn,
    Proxy,
}

#[derive(Debug, Clone, Deserialize)]
struct RangeCatalog {
    catalog_version: String,
    #[allow(dead_code)]
    generated_at: String,
    #[allow(dead_code)]
    generated_at_unix: u64,
    sets: Vec<RangeSet>,
}

#[derive(Debug, Clone, Deserialize)]
struct RangeSet {
    id: String,
    #[allow(dead_code)]
    label: String,
    #[allow(dead_code)]
    provider: String,
    classification: RangeClassification,
    cidrs: Vec<String>,
}

#[derive(Debug, Clone)]
struct CompiledSet {
    id: String,
    classification: RangeClassification,
    nets: Vec<IpNet>,
}

static RANGE_CATALOG: Lazy<RangeCatalog> = Lazy::new(|| {
    serde_json::from_str::<RangeCatalog>(DATACENTER_RANGES_TEXT)
        .unwrap_or_else(|err| panic!("Invalid embedded datacenter range catalog: {}", err))
});

static COMPILED_SETS: Lazy<Vec<CompiledSet>> = Lazy::new(|| {
    RANGE_CATALOG
        .sets
        .iter()
        .map(|set| CompiledSet {
            id: set.id.clone(),
            classification: set.classification,
            nets: set
                .cidrs
                .iter()
                .filter_map(|raw| raw.trim().parse::<IpNet>().ok())
                .collect(),
        })
        .collect()
});

pub fn catalog_version() -> String {
    RANGE_CATALOG.catalog_version.clone()
}

/// Outcome of risk scoring for one network address.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RiskAssessment {
    pub score: u8,
    pub factors: Vec<String>,
    pub is_vpn: bool,
    pub is_proxy: bool,
    pub is_datacenter: bool,
}

impl RiskAssessment {
    fn clean() -> Self {
        RiskAssessment {
            score: 0,
            factors: Vec::new(),
            is_vpn: false,
            is_proxy: false,
            is_datacenter: false,
        }
    }

    /// Unparseable input is treated as maximum risk, never an error.
    fn invalid_address(raw: &str) -> Self {
        RiskAssessment {
            score: SCORE_MAX,
            factors: vec![format!("unparseable_address:{}", raw)],
            is_vpn: false,
            is_proxy: false,
            is_datacenter: false,
        }
    }

    pub(crate) fn add(&mut self, points: u8, factor: String) {
        self.score = self.score.saturating_add(points).min(SCORE_MAX);
        self.factors.push(factor);
    }

    /// The visitor's AI and session ceilings are halved when any of
    /// these classifications hold, regardless of the numeric score.
    pub fn reduces_ceilings(&self) -> bool {
        self.is_vpn || self.is_proxy || self.is_datacenter
    }
}

fn is_reserved(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Most-specific (longest prefix) match per classification across the
/// whole catalog.
fn best_match(addr: &IpAddr, classification: RangeClassification) -> Option<(String, IpNet)> {
    let mut best: Option<(String, IpNet)> = None;
    for set in COMPILED_SETS.iter() {
        if set.classification != classification {
            continue;
        }
        for net in &set.nets {
            if !net.contains(addr) {
                continue;
            }
            let better = match &best {
                Some((_, current)) => net.prefix_len() > current.prefix_len(),
                None => true,
            };
            if better {
                best = Some((set.id.clone(), *net));
            }
        }
    }
    best
}

/// Score a network address using only the embedded catalog and address
/// class. Pure; remote enrichment is layered on by the reputation
/// module.
pub fn assess_local(address: &str) -> RiskAssessment {
    let Ok(addr) = address.trim().parse::<IpAddr>() else {
        return RiskAssessment::invalid_address(address);
    };

    let mut assessment = RiskAssessment::clean();

    if is_reserved(&addr) {
        assessment.add(SCORE_RESERVED, "reserved_or_private_range".to_string());
    }
    if let Some((set_id, net)) = best_match(&addr, RangeClassification::Datacenter) {
        assessment.is_datacenter = true;
        assessment.add(SCORE_DATACENTER, format!("datacenter:{}:{}", set_id, net));
    }
    if let Some((set_id, net)) = best_match(&addr, RangeClassification::Vpn) {
        assessment.is_vpn = true;
        assessment.add(SCORE_VPN, format!("vpn:{}:{}", set_id, net));
    }
    if let Some((set_id, net)) = best_match(&addr, RangeClassification::Proxy) {
        assessment.is_proxy = true;
        assessment.add(SCORE_PROXY, format!("proxy:{}:{}", set_id, net));
    }

    assessment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_address_is_flagged_datacenter() {
        let assessment = assess_local("52.0.0.1");
        assert!(assessment.is_datacenter);
        assert!(assessment.score >= SCORE_DATACENTER);
        assert!(assessment
            .factors
            .iter()
            .any(|f| f.starts_with("datacenter:aws_ec2")));
    }

    #[test]
    fn documentation_address_is_clean() {
        let assessment = assess_local("203.0.113.5");
        assert!(!assessment.is_datacenter);
        assert!(!assessment.is_vpn);
        assert!(!assessment.is_proxy);
        assert_eq!(assessment.score, 0);
        assert!(assessment.factors.is_empty());
    }

    #[test]
    fn private_and_loopback_ranges_are_suspicious() {
        for addr in ["10.1.2.3", "192.168.0.1", "127.0.0.1", "::1"] {
            let assessment = assess_local(addr);
            assert!(assessment.score >= SCORE_RESERVED, "{} not flagged", addr);
            assert!(assessment
                .factors
                .iter()
                .any(|f| f == "reserved_or_private_range"));
        }
    }

    #[test]
    fn unparseable_address_is_maximum_risk() {
        let assessment = assess_local("not-an-address");
        assert_eq!(assessment.score, SCORE_MAX);
        assert!(assessment.factors[0].starts_with("unparseable_address"));
    }

    #[test]
    fn vpn_range_sets_flag_and_adds_score() {
        let assessment = assess_local("185.159.156.10");
        assert!(assessment.is_vpn);
        assert!(assessment.score >= SCORE_VPN);
    }

    #[test]
    fn scoring_is_monotonic_across_factors() {
        // An address in both a datacenter and reserved check can only
        // accumulate, capped at 100.
        let reserved_only = assess_local("10.0.0.1");
        let datacenter = assess_local("52.0.0.1");
        assert!(reserved_only.score <= SCORE_MAX);
        assert!(datacenter.score <= SCORE_MAX);
        assert!(datacenter.factors.len() >= 1);
    }

    #[test]
    fn ipv6_cloud_prefix_matches() {
        let assessment = assess_local("2600:1f00::1");
        assert!(assessment.is_datacenter);
    }
}
