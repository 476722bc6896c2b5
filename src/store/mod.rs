use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{LedgerEntry, PaymentIntent, Subscription};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Durable state behind the engine: an append-only ledger, status-mutable
/// payment intents, and one subscription row per user. Status transitions are
/// compare-and-swap operations so concurrent confirmers, the stale-intent job
/// and the repair pass never race each other into double effects.
#[async_trait]
pub trait Store: Send + Sync {
    // Ledger. Append is the only mutation; `DuplicateEntry` when an entry for
    // the same intent already exists.
    async fn append_entry(&self, entry: LedgerEntry) -> EngineResult<Uuid>;
    async fn ledger_for_user(&self, user_id: i64) -> EngineResult<Vec<LedgerEntry>>;
    async fn export_ledger(&self) -> EngineResult<Vec<LedgerEntry>>;

    // Payment intents. Insert fails `DuplicateEntry` on an existing id so a
    // retried create resolves to the stored intent.
    async fn insert_intent(&self, intent: PaymentIntent) -> EngineResult<()>;
    async fn intent(&self, intent_id: Uuid) -> EngineResult<Option<PaymentIntent>>;
    async fn pending_intents_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EngineResult<Vec<PaymentIntent>>;
    /// PENDING -> CONFIRMED, recording the external ref. Returns whether this
    /// caller won the transition.
    async fn confirm_intent_if_pending(
        &self,
        intent_id: Uuid,
        external_ref: &str,
        confirmed_at: DateTime<Utc>,
    ) -> EngineResult<bool>;
    async fn fail_intent_if_pending(&self, intent_id: Uuid, reason: &str) -> EngineResult<bool>;
    async fn expire_intent_if_pending(&self, intent_id: Uuid) -> EngineResult<bool>;
    /// All CONFIRMED intents, scanned by the repair pass.
    async fn confirmed_intents(&self) -> EngineResult<Vec<PaymentIntent>>;

    // Subscriptions.
    async fn subscription(&self, user_id: i64) -> EngineResult<Option<Subscription>>;
    async fn upsert_subscription(&self, sub: Subscription) -> EngineResult<()>;
    async fn subscriptions_not_none(&self) -> EngineResult<Vec<Subscription>>;
}
