use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Catalog shipped when no override is configured. Mirrors the stock plan set
/// of the bot this engine backs.
pub const DEFAULT_CATALOG_JSON: &str = r#"[
    {
        "id": "basic",
        "name": "Basic",
        "price_minor": 1500000,
        "currency": "IRR",
        "duration_days": 30,
        "features": ["signals.basic", "support.email"]
    },
    {
        "id": "premium",
        "name": "Premium",
        "price_minor": 3500000,
        "currency": "IRR",
        "duration_days": 30,
        "features": ["signals.basic", "signals.technical", "support.chat"]
    },
    {
        "id": "vip",
        "name": "VIP",
        "price_minor": 7500000,
        "currency": "IRR",
        "duration_days": 90,
        "features": ["signals.basic", "signals.technical", "signals.vip", "support.phone"]
    }
]"#;

/// key: plan-model -> price in integer minor units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub price_minor: i64,
    pub currency: String,
    pub duration_days: i64,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Immutable in-memory plan table, loaded once at startup and validated before
/// any intent can be created against it.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
}

impl PlanCatalog {
    pub fn from_json_str(raw: &str) -> EngineResult<Self> {
        let plans: Vec<Plan> = serde_json::from_str(raw)
            .map_err(|err| EngineError::InvalidCatalog(format!("malformed plan JSON: {err}")))?;
        Self::from_plans(plans)
    }

    pub fn from_path(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            EngineError::InvalidCatalog(format!(
                "failed to read {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_plans(plans: Vec<Plan>) -> EngineResult<Self> {
        if plans.is_empty() {
            return Err(EngineError::InvalidCatalog("catalog is empty".into()));
        }
        let mut table = HashMap::with_capacity(plans.len());
        for plan in plans {
            if plan.id.trim().is_empty() {
                return Err(EngineError::InvalidCatalog("plan with empty id".into()));
            }
            if plan.price_minor <= 0 {
                return Err(EngineError::InvalidCatalog(format!(
                    "plan {} has non-positive price",
                    plan.id
                )));
            }
            if plan.duration_days <= 0 {
                return Err(EngineError::InvalidCatalog(format!(
                    "plan {} has non-positive duration",
                    plan.id
                )));
            }
            if plan.currency.trim().is_empty() {
                return Err(EngineError::InvalidCatalog(format!(
                    "plan {} has empty currency",
                    plan.id
                )));
            }
            if table.insert(plan.id.clone(), plan).is_some() {
                return Err(EngineError::InvalidCatalog("duplicate plan id".into()));
            }
        }
        Ok(PlanCatalog { plans: table })
    }

    pub fn get(&self, plan_id: &str) -> EngineResult<&Plan> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| EngineError::UnknownPlan(plan_id.to_string()))
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_parses_and_validates() {
        let catalog = PlanCatalog::from_json_str(DEFAULT_CATALOG_JSON).unwrap();
        let basic = catalog.get("basic").unwrap();
        assert_eq!(basic.duration_days, 30);
        assert_eq!(basic.currency, "IRR");
        assert!(catalog.get("nope").is_err());
    }

    #[test]
    fn empty_catalog_is_rejected() {
        let err = PlanCatalog::from_json_str("[]").unwrap_err();
        assert!(matches!(err, EngineError::InvalidCatalog(_)));
    }

    #[test]
    fn non_positive_price_is_rejected() {
        let raw = r#"[{"id":"x","name":"X","price_minor":0,"currency":"IRR","duration_days":30}]"#;
        let err = PlanCatalog::from_json_str(raw).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCatalog(_)));
    }

    #[test]
    fn duplicate_plan_id_is_rejected() {
        let raw = r#"[
            {"id":"x","name":"X","price_minor":10,"currency":"IRR","duration_days":30},
            {"id":"x","name":"X2","price_minor":20,"currency":"IRR","duration_days":30}
        ]"#;
        assert!(PlanCatalog::from_json_str(raw).is_err());
    }
}
