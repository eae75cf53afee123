pub mod fingerprint;
pub mod ip_risk;
pub mod reputation;
