use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// Immutable rate table published by the refresh collaborator. Rates are
/// expressed as units of each currency per one unit of the snapshot's base.
#[derive(Debug, Clone)]
pub struct RateSnapshot {
    rates: HashMap<String, f64>,
    pub fetched_at: DateTime<Utc>,
}

/// Single-writer rate cache with snapshot reads. Conversion refuses to use a
/// snapshot older than `max_age` instead of silently serving stale data.
pub struct CurrencyConverter {
    snapshot: RwLock<Option<Arc<RateSnapshot>>>,
    max_age: Duration,
}

impl CurrencyConverter {
    pub fn new(max_age: Duration) -> Self {
        CurrencyConverter {
            snapshot: RwLock::new(None),
            max_age,
        }
    }

    /// Writer side, called by the external rate-refresh collaborator.
    pub fn publish(&self, rates: HashMap<String, f64>, fetched_at: DateTime<Utc>) {
        let snapshot = Arc::new(RateSnapshot { rates, fetched_at });
        info!(%fetched_at, currencies = snapshot.rates.len(), "published rate snapshot");
        *self.snapshot.write().unwrap() = Some(snapshot);
    }

    pub fn convert(
        &self,
        amount_minor: i64,
        from: &str,
        to: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        if from == to {
            return Ok(amount_minor);
        }

        let snapshot = self.snapshot.read().unwrap().clone();
        let snapshot = snapshot.ok_or(EngineError::StaleRateData {
            age_secs: None,
            max_secs: self.max_age.num_seconds(),
        })?;

        let age = now - snapshot.fetched_at;
        if age > self.max_age {
            return Err(EngineError::StaleRateData {
                age_secs: Some(age.num_seconds()),
                max_secs: self.max_age.num_seconds(),
            });
        }

        let from_rate = *snapshot
            .rates
            .get(from)
            .ok_or_else(|| EngineError::UnknownCurrency(from.to_string()))?;
        let to_rate = *snapshot
            .rates
            .get(to)
            .ok_or_else(|| EngineError::UnknownCurrency(to.to_string()))?;
        if from_rate <= 0.0 {
            return Err(EngineError::UnknownCurrency(from.to_string()));
        }

        let converted = amount_minor as f64 * to_rate / from_rate;
        Ok(converted.round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter_with(rates: &[(&str, f64)], fetched_at: DateTime<Utc>) -> CurrencyConverter {
        let converter = CurrencyConverter::new(Duration::hours(1));
        converter.publish(
            rates.iter().map(|(c, r)| (c.to_string(), *r)).collect(),
            fetched_at,
        );
        converter
    }

    #[test]
    fn identity_conversion_needs_no_snapshot() {
        let converter = CurrencyConverter::new(Duration::hours(1));
        assert_eq!(converter.convert(100, "IRR", "IRR", Utc::now()).unwrap(), 100);
    }

    #[test]
    fn converts_through_common_base() {
        let now = Utc::now();
        let converter = converter_with(&[("USD", 1.0), ("IRR", 500_000.0)], now);
        assert_eq!(converter.convert(1_000_000, "IRR", "USD", now).unwrap(), 2);
        assert_eq!(converter.convert(2, "USD", "IRR", now).unwrap(), 1_000_000);
    }

    #[test]
    fn stale_snapshot_is_rejected() {
        let fetched = Utc::now() - Duration::hours(2);
        let converter = converter_with(&[("USD", 1.0), ("IRR", 500_000.0)], fetched);
        let err = converter.convert(1, "USD", "IRR", Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::StaleRateData { .. }));
    }

    #[test]
    fn missing_snapshot_is_reported_as_stale() {
        let converter = CurrencyConverter::new(Duration::hours(1));
        let err = converter.convert(1, "USD", "IRR", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::StaleRateData { age_secs: None, .. }
        ));
    }

    #[test]
    fn unknown_currency_is_rejected() {
        let now = Utc::now();
        let converter = converter_with(&[("USD", 1.0)], now);
        let err = converter.convert(1, "USD", "XYZ", now).unwrap_err();
        assert!(matches!(err, EngineError::UnknownCurrency(code) if code == "XYZ"));
    }
}
