use chrono::Duration;
use once_cell::sync::Lazy;

use crate::catalog::{PlanCatalog, DEFAULT_CATALOG_JSON};
use crate::error::EngineResult;

/// Days before expiry at which a subscription is flagged EXPIRING_SOON.
pub static EXPIRY_WARNING_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("EXPIRY_WARNING_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(3)
});

/// Minutes a PENDING intent may sit before the stale-intent job expires it.
pub static STALE_INTENT_MAX_AGE_MINUTES: Lazy<i64> = Lazy::new(|| {
    std::env::var("STALE_INTENT_MAX_AGE_MINUTES")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(60)
});

/// Maximum age of the exchange-rate snapshot before conversions are refused.
pub static RATE_MAX_AGE_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("RATE_MAX_AGE_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});

/// Block confirmations required before a crypto confirmation is applied.
pub static CRYPTO_MIN_CONFIRMATIONS: Lazy<u32> = Lazy::new(|| {
    std::env::var("CRYPTO_MIN_CONFIRMATIONS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(3)
});

/// key: sweep-config -> expiry sweep cadence
pub static SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// key: sweep-config -> stale-intent scan cadence
pub static STALE_INTENT_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("STALE_INTENT_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(600)
});

/// When set to a truthy value, allows the daemon to continue running even if
/// database migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// Optional path to a plan catalog JSON file.
pub static PLAN_CATALOG_PATH: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("PLAN_CATALOG_PATH"));

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Thresholds injected into the engine so components stay testable with fixed
/// inputs instead of reading ambient globals.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub warning_window: Duration,
    pub stale_intent_max_age: Duration,
    pub rate_max_age: Duration,
    pub crypto_min_confirmations: u32,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        EngineConfig {
            warning_window: Duration::days(*EXPIRY_WARNING_DAYS),
            stale_intent_max_age: Duration::minutes(*STALE_INTENT_MAX_AGE_MINUTES),
            rate_max_age: Duration::seconds(*RATE_MAX_AGE_SECS),
            crypto_min_confirmations: *CRYPTO_MIN_CONFIRMATIONS,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            warning_window: Duration::days(3),
            stale_intent_max_age: Duration::minutes(60),
            rate_max_age: Duration::seconds(3600),
            crypto_min_confirmations: 3,
        }
    }
}

/// Loads the plan catalog from `PLAN_CATALOG_JSON`, then `PLAN_CATALOG_PATH`,
/// falling back to the built-in defaults.
pub fn plan_catalog_from_env() -> EngineResult<PlanCatalog> {
    if let Some(raw) = read_optional_env("PLAN_CATALOG_JSON") {
        return PlanCatalog::from_json_str(&raw);
    }
    if let Some(path) = PLAN_CATALOG_PATH.as_ref() {
        return PlanCatalog::from_path(path);
    }
    PlanCatalog::from_json_str(DEFAULT_CATALOG_JSON)
}
