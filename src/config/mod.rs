// src/config/mod.rs
// Configuration for Demo Warden. Tunables come from the process
// environment overlaid on the embedded config/defaults.env; everything
// is parsed and clamped once at startup into an explicit Config value
// that callers pass by reference. There is no mutable global limit
// table.

use std::{collections::HashMap, env};

use once_cell::sync::Lazy;

const DEFAULTS_ENV_TEXT: &str = include_str!("../../config/defaults.env");

const AI_WINDOW_LIMIT_MAX: u32 = 1_000;
const AI_WINDOW_MINUTES_MIN: u64 = 1;
const AI_WINDOW_MINUTES_MAX: u64 = 24 * 60;
const SESSION_TTL_HOURS_MIN: u64 = 1;
const SESSION_TTL_HOURS_MAX: u64 = 24 * 30;
const WINDOW_CAPACITY_MIN: usize = 8;
const WINDOW_CAPACITY_MAX: usize = 512;
const RISK_SCORE_MAX: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingVar(String),
    InvalidVar(String, String),
}

impl ConfigError {
    pub fn message(&self) -> String {
        match self {
            ConfigError::MissingVar(name) => format!("Missing required config var {}", name),
            ConfigError::InvalidVar(name, value) => {
                format!("Invalid config var {}={}", name, value)
            }
        }
    }
}

/// Limit profile selector. The generous table exists for development;
/// production runs strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitsProfile {
    Strict,
    Generous,
}

impl LimitsProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitsProfile::Strict => "strict",
            LimitsProfile::Generous => "generous",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(LimitsProfile::Strict),
            "generous" => Some(LimitsProfile::Generous),
            _ => None,
        }
    }
}

/// Per-visitor ceilings. Validated once at load and passed by
/// reference; `effective_*` accessors apply the VPN reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_ai_generations: u32,
    pub max_sessions: u32,
    pub sessions_per_hour: u32,
    pub sessions_per_day: u32,
    pub max_projects_per_session: u32,
    pub ai_window_limit: u32,
    pub ai_window_minutes: u64,
    pub session_ttl_hours: u64,
    pub max_extensions: u32,
    pub extension_hours: u64,
    pub vpn_divisor: u32,
}

impl Limits {
    /// Development table: loose enough that local iteration never trips
    /// a ceiling, tight enough that a runaway script still stops.
    pub fn generous() -> Self {
        Limits {
            max_ai_generations: 500,
            max_sessions: 200,
            sessions_per_hour: 50,
            sessions_per_day: 200,
            max_projects_per_session: 20,
            ai_window_limit: 100,
            ai_window_minutes: 10,
            session_ttl_hours: 168,
            max_extensions: 10,
            extension_hours: 24,
            vpn_divisor: 2,
        }
    }

    pub fn session_ttl_seconds(&self) -> u64 {
        self.session_ttl_hours * 3600
    }

    pub fn extension_seconds(&self) -> u64 {
        self.extension_hours * 3600
    }

    pub fn ai_window_seconds(&self) -> u64 {
        self.ai_window_minutes * 60
    }

    pub fn effective_max_ai_generations(&self, vpn: bool) -> u32 {
        reduce_cap(self.max_ai_generations, vpn, self.vpn_divisor)
    }

    pub fn effective_max_sessions(&self, vpn: bool) -> u32 {
        reduce_cap(self.max_sessions, vpn, self.vpn_divisor)
    }

    pub fn effective_ai_window_limit(&self, vpn: bool) -> u32 {
        reduce_cap(self.ai_window_limit, vpn, self.vpn_divisor)
    }
}

fn reduce_cap(cap: u32, vpn: bool, divisor: u32) -> u32 {
    if vpn && divisor > 1 {
        cap / divisor
    } else {
        cap
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub profile: LimitsProfile,
    pub deploy_env: String,
    pub limits: Limits,
    pub risk_block_threshold: u8,
    pub risk_suspicious_threshold: u8,
    pub reputation_api_url: Option<String>,
    pub reputation_api_key: Option<String>,
    pub reputation_cache_ttl_seconds: u64,
    pub reconcile_interval_seconds: u64,
    pub reconcile_safety_margin_seconds: u64,
    pub expiring_soon_seconds: u64,
    pub window_capacity: usize,
    pub event_log_retention_hours: u64,
}

static DEFAULTS_MAP: Lazy<HashMap<String, String>> = Lazy::new(|| {
    parse_defaults_env(DEFAULTS_ENV_TEXT)
        .unwrap_or_else(|line| panic!("Invalid embedded defaults.env near: {}", line))
});

fn parse_defaults_env(text: &str) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(trimmed.to_string());
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

/// Process env wins over the embedded defaults.
fn lookup(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => DEFAULTS_MAP.get(name).cloned(),
    }
}

fn lookup_required(name: &str) -> Result<String, ConfigError> {
    lookup(name).ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn lookup_u64(name: &str) -> Result<u64, ConfigError> {
    let raw = lookup_required(name)?;
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidVar(name.to_string(), raw))
}

fn lookup_u32(name: &str) -> Result<u32, ConfigError> {
    let raw = lookup_required(name)?;
    raw.trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidVar(name.to_string(), raw))
}

fn lookup_u8(name: &str) -> Result<u8, ConfigError> {
    let raw = lookup_required(name)?;
    raw.trim()
        .parse::<u8>()
        .map_err(|_| ConfigError::InvalidVar(name.to_string(), raw))
}

fn lookup_optional(name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.trim().is_empty())
}

fn strict_limits_from_env() -> Result<Limits, ConfigError> {
    Ok(Limits {
        max_ai_generations: lookup_u32("WARDEN_MAX_AI_GENERATIONS")?,
        max_sessions: lookup_u32("WARDEN_MAX_SESSIONS")?,
        sessions_per_hour: lookup_u32("WARDEN_SESSIONS_PER_HOUR")?,
        sessions_per_day: lookup_u32("WARDEN_SESSIONS_PER_DAY")?,
        max_projects_per_session: lookup_u32("WARDEN_MAX_PROJECTS_PER_SESSION")?,
        ai_window_limit: lookup_u32("WARDEN_AI_WINDOW_LIMIT")?,
        ai_window_minutes: lookup_u64("WARDEN_AI_WINDOW_MINUTES")?,
        session_ttl_hours: lookup_u64("WARDEN_SESSION_TTL_HOURS")?,
        max_extensions: lookup_u32("WARDEN_MAX_EXTENSIONS")?,
        extension_hours: lookup_u64("WARDEN_EXTENSION_HOURS")?,
        vpn_divisor: lookup_u32("WARDEN_VPN_DIVISOR")?,
    })
}

fn clamp_limits(limits: &mut Limits) {
    limits.ai_window_limit = limits.ai_window_limit.min(AI_WINDOW_LIMIT_MAX);
    limits.ai_window_minutes = limits
        .ai_window_minutes
        .clamp(AI_WINDOW_MINUTES_MIN, AI_WINDOW_MINUTES_MAX);
    limits.session_ttl_hours = limits
        .session_ttl_hours
        .clamp(SESSION_TTL_HOURS_MIN, SESSION_TTL_HOURS_MAX);
    if limits.vpn_divisor == 0 {
        limits.vpn_divisor = 1;
    }
}

fn validate_reputation_url(value: &str) -> Result<(), ConfigError> {
    let lower = value.trim().to_ascii_lowercase();
    if lower.starts_with("https://") || lower.starts_with("http://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidVar(
            "WARDEN_REPUTATION_API_URL".to_string(),
            value.to_string(),
        ))
    }
}

impl Config {
    /// Parse and validate the full configuration. Missing or malformed
    /// required limits are fatal; callers surface the error at startup.
    pub fn load_from_env() -> Result<Config, ConfigError> {
        let profile_raw = lookup_required("WARDEN_LIMITS_PROFILE")?;
        let profile = LimitsProfile::parse(&profile_raw).ok_or_else(|| {
            ConfigError::InvalidVar("WARDEN_LIMITS_PROFILE".to_string(), profile_raw)
        })?;
        let deploy_env = lookup_required("WARDEN_DEPLOY_ENV")?
            .trim()
            .to_ascii_lowercase();

        let mut limits = match profile {
            LimitsProfile::Strict => strict_limits_from_env()?,
            LimitsProfile::Generous => Limits::generous(),
        };
        clamp_limits(&mut limits);

        let reputation_api_url = lookup_optional("WARDEN_REPUTATION_API_URL");
        if let Some(url) = reputation_api_url.as_deref() {
            validate_reputation_url(url)?;
        }

        let risk_block_threshold = lookup_u8("WARDEN_RISK_BLOCK_THRESHOLD")?.min(RISK_SCORE_MAX);
        let risk_suspicious_threshold =
            lookup_u8("WARDEN_RISK_SUSPICIOUS_THRESHOLD")?.min(risk_block_threshold);

        let window_capacity = (lookup_u64("WARDEN_WINDOW_CAPACITY")? as usize)
            .clamp(WINDOW_CAPACITY_MIN, WINDOW_CAPACITY_MAX);

        let cfg = Config {
            profile,
            deploy_env,
            limits,
            risk_block_threshold,
            risk_suspicious_threshold,
            reputation_api_url,
            reputation_api_key: lookup_optional("WARDEN_REPUTATION_API_KEY"),
            reputation_cache_ttl_seconds: lookup_u64("WARDEN_REPUTATION_CACHE_TTL_SECONDS")?,
            reconcile_interval_seconds: lookup_u64("WARDEN_RECONCILE_INTERVAL_SECONDS")?,
            reconcile_safety_margin_seconds: lookup_u64("WARDEN_RECONCILE_SAFETY_MARGIN_SECONDS")?,
            expiring_soon_seconds: lookup_u64("WARDEN_EXPIRING_SOON_SECONDS")?,
            window_capacity,
            event_log_retention_hours: lookup_u64("WARDEN_EVENT_LOG_RETENTION_HOURS")?,
        };

        for warning in cfg.profile_warnings() {
            println!("[LIMITS] {}", warning);
        }

        Ok(cfg)
    }

    /// Warnings that must be impossible to miss in logs.
    pub fn profile_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.profile == LimitsProfile::Generous && self.deploy_env != "development" {
            warnings.push(format!(
                "GENEROUS LIMIT TABLE ACTIVE IN '{}' ENVIRONMENT; demo quotas are effectively disabled",
                self.deploy_env
            ));
        }
        warnings
    }
}

static LOADED_CONFIG: Lazy<Result<Config, ConfigError>> = Lazy::new(Config::load_from_env);

/// Startup-cached configuration for the request path. Tests use
/// `Config::load_from_env` (or build a Config literal) instead so they
/// can vary the environment.
pub fn loaded() -> Result<&'static Config, ConfigError> {
    match &*LOADED_CONFIG {
        Ok(cfg) => Ok(cfg),
        Err(err) => Err(err.clone()),
    }
}

pub fn api_key() -> Option<String> {
    env::var("WARDEN_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
}

pub fn forwarded_ip_secret() -> Option<String> {
    env::var("WARDEN_FORWARDED_IP_SECRET")
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Test-friendly baseline mirroring the strict defaults.
pub fn baseline_config() -> Config {
    Config {
        profile: LimitsProfile::Strict,
        deploy_env: "test".to_string(),
        limits: Limits {
            max_ai_generations: 25,
            max_sessions: 10,
            sessions_per_hour: 3,
            sessions_per_day: 6,
            max_projects_per_session: 3,
            ai_window_limit: 5,
            ai_window_minutes: 10,
            session_ttl_hours: 48,
            max_extensions: 2,
            extension_hours: 24,
            vpn_divisor: 2,
        },
        risk_block_threshold: 80,
        risk_suspicious_threshold: 50,
        reputation_api_url: None,
        reputation_api_key: None,
        reputation_cache_ttl_seconds: 3600,
        reconcile_interval_seconds: 3600,
        reconcile_safety_margin_seconds: 5,
        expiring_soon_seconds: 7200,
        window_capacity: 50,
        event_log_retention_hours: 168,
    }
}
