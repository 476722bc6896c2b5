use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// key: entitlement-status -> derived from expires_at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
    ExpiringSoon,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::ExpiringSoon => "expiring_soon",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(SubscriptionStatus::None),
            "active" => Some(SubscriptionStatus::Active),
            "expiring_soon" => Some(SubscriptionStatus::ExpiringSoon),
            "expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Manual,
    BankCard,
    Crypto,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Manual => "manual",
            PaymentMethod::BankCard => "bank_card",
            PaymentMethod::Crypto => "crypto",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(PaymentMethod::Manual),
            "bank_card" => Some(PaymentMethod::BankCard),
            "crypto" => Some(PaymentMethod::Crypto),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Confirmed,
    Failed,
    Expired,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Failed => "failed",
            IntentStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(IntentStatus::Pending),
            "confirmed" => Some(IntentStatus::Confirmed),
            "failed" => Some(IntentStatus::Failed),
            "expired" => Some(IntentStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Credit,
    ManualAdjustment,
    Refund,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Credit => "credit",
            LedgerKind::ManualAdjustment => "manual_adjustment",
            LedgerKind::Refund => "refund",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credit" => Some(LedgerKind::Credit),
            "manual_adjustment" => Some(LedgerKind::ManualAdjustment),
            "refund" => Some(LedgerKind::Refund),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per user. `last_notified_status` is the sweep deduplication marker:
/// a transition notification is emitted only when the new status differs from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: i64,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub renewed_count: i32,
    pub last_notified_status: Option<SubscriptionStatus>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Placeholder for a user this engine has never credited.
    pub fn none(user_id: i64, now: DateTime<Utc>) -> Self {
        Subscription {
            user_id,
            plan_id: String::new(),
            status: SubscriptionStatus::None,
            expires_at: None,
            renewed_count: 0,
            last_notified_status: None,
            updated_at: now,
        }
    }
}

/// One attempted payment. The intent id doubles as the idempotency key; rows
/// transition status but are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: Uuid,
    pub user_id: i64,
    pub plan_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub external_ref: Option<String>,
    pub fail_reason: Option<String>,
}

/// Append-only monetary record. `plan_id` and `credited_days` are carried so a
/// user's entitlement can be replayed from ledger history alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub user_id: i64,
    pub intent_id: Option<Uuid>,
    pub plan_id: Option<String>,
    pub credited_days: i64,
    pub amount_minor: i64,
    pub currency: String,
    pub kind: LedgerKind,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}
