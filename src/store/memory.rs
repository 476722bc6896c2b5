use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{IntentStatus, LedgerEntry, PaymentIntent, Subscription, SubscriptionStatus};
use crate::store::Store;

/// In-memory store used by tests and embedding collaborators that bring their
/// own persistence. Semantics mirror `PgStore`, including the unique-intent
/// guard on ledger appends.
#[derive(Default)]
pub struct MemoryStore {
    ledger: Mutex<Vec<LedgerEntry>>,
    ledger_intents: DashMap<Uuid, Uuid>,
    intents: DashMap<Uuid, PaymentIntent>,
    subscriptions: DashMap<i64, Subscription>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_entry(&self, entry: LedgerEntry) -> EngineResult<Uuid> {
        if let Some(intent_id) = entry.intent_id {
            match self.ledger_intents.entry(intent_id) {
                Entry::Occupied(_) => return Err(EngineError::DuplicateEntry(intent_id)),
                Entry::Vacant(slot) => {
                    slot.insert(entry.entry_id);
                }
            }
        }
        let entry_id = entry.entry_id;
        self.ledger.lock().unwrap().push(entry);
        Ok(entry_id)
    }

    async fn ledger_for_user(&self, user_id: i64) -> EngineResult<Vec<LedgerEntry>> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn export_ledger(&self) -> EngineResult<Vec<LedgerEntry>> {
        Ok(self.ledger.lock().unwrap().clone())
    }

    async fn insert_intent(&self, intent: PaymentIntent) -> EngineResult<()> {
        match self.intents.entry(intent.intent_id) {
            Entry::Occupied(_) => Err(EngineError::DuplicateEntry(intent.intent_id)),
            Entry::Vacant(slot) => {
                slot.insert(intent);
                Ok(())
            }
        }
    }

    async fn intent(&self, intent_id: Uuid) -> EngineResult<Option<PaymentIntent>> {
        Ok(self.intents.get(&intent_id).map(|found| found.clone()))
    }

    async fn pending_intents_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EngineResult<Vec<PaymentIntent>> {
        Ok(self
            .intents
            .iter()
            .filter(|item| item.status == IntentStatus::Pending && item.created_at < cutoff)
            .map(|item| item.clone())
            .collect())
    }

    async fn confirm_intent_if_pending(
        &self,
        intent_id: Uuid,
        external_ref: &str,
        confirmed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        match self.intents.get_mut(&intent_id) {
            Some(mut intent) if intent.status == IntentStatus::Pending => {
                intent.status = IntentStatus::Confirmed;
                intent.external_ref = Some(external_ref.to_string());
                intent.confirmed_at = Some(confirmed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_intent_if_pending(&self, intent_id: Uuid, reason: &str) -> EngineResult<bool> {
        match self.intents.get_mut(&intent_id) {
            Some(mut intent) if intent.status == IntentStatus::Pending => {
                intent.status = IntentStatus::Failed;
                intent.fail_reason = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_intent_if_pending(&self, intent_id: Uuid) -> EngineResult<bool> {
        match self.intents.get_mut(&intent_id) {
            Some(mut intent) if intent.status == IntentStatus::Pending => {
                intent.status = IntentStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn confirmed_intents(&self) -> EngineResult<Vec<PaymentIntent>> {
        Ok(self
            .intents
            .iter()
            .filter(|item| item.status == IntentStatus::Confirmed)
            .map(|item| item.clone())
            .collect())
    }

    async fn subscription(&self, user_id: i64) -> EngineResult<Option<Subscription>> {
        Ok(self.subscriptions.get(&user_id).map(|found| found.clone()))
    }

    async fn upsert_subscription(&self, sub: Subscription) -> EngineResult<()> {
        self.subscriptions.insert(sub.user_id, sub);
        Ok(())
    }

    async fn subscriptions_not_none(&self) -> EngineResult<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|item| item.status != SubscriptionStatus::None)
            .map(|item| item.clone())
            .collect())
    }
}
