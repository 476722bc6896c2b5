use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::locks::UserLocks;
use crate::models::{
    IntentStatus, LedgerEntry, LedgerKind, PaymentIntent, PaymentMethod, Subscription,
    SubscriptionStatus,
};
use crate::notify::{NotificationEvent, NotificationKind, Notifier};
use crate::rates::CurrencyConverter;
use crate::store::Store;
use crate::subscription;

const SYSTEM_ACTOR: &str = "system";

/// key: subscription-engine -> intent lifecycle, ledger, entitlement
///
/// The confirm-and-credit unit of work follows a write-ahead-marker sequence:
/// the PENDING -> CONFIRMED CAS lands first (the idempotency guard), then the
/// ledger append, then the subscription update, all under the user's lock. A
/// crash between steps is completed by `repair`, which makes the whole
/// sequence resumable instead of requiring multi-row transactions.
pub struct SubscriptionEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    catalog: Arc<PlanCatalog>,
    converter: Arc<CurrencyConverter>,
    notifier: Arc<dyn Notifier>,
    locks: UserLocks,
    config: EngineConfig,
}

impl SubscriptionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        catalog: Arc<PlanCatalog>,
        converter: Arc<CurrencyConverter>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        SubscriptionEngine {
            store,
            clock,
            catalog,
            converter,
            notifier,
            locks: UserLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Evicts per-user lock slots with no current holder; driven by the sweep.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    // ---- query surface ----

    pub async fn get_subscription(&self, user_id: i64) -> EngineResult<Subscription> {
        let found = self.store.subscription(user_id).await?;
        Ok(found.unwrap_or_else(|| Subscription::none(user_id, self.clock.now())))
    }

    pub async fn get_ledger(&self, user_id: i64) -> EngineResult<Vec<LedgerEntry>> {
        self.store.ledger_for_user(user_id).await
    }

    pub async fn get_intent(&self, intent_id: Uuid) -> EngineResult<PaymentIntent> {
        self.store
            .intent(intent_id)
            .await?
            .ok_or(EngineError::IntentNotFound(intent_id))
    }

    /// Read-only dump of the whole ledger for reporting collaborators, in
    /// creation order.
    pub async fn export_ledger(&self) -> EngineResult<Vec<LedgerEntry>> {
        self.store.export_ledger().await
    }

    pub async fn tracked_subscriptions(&self) -> EngineResult<Vec<Subscription>> {
        self.store.subscriptions_not_none().await
    }

    /// Plan price converted for display or payment in another currency.
    pub fn quote(&self, plan_id: &str, currency: &str) -> EngineResult<i64> {
        let plan = self.catalog.get(plan_id)?;
        self.converter
            .convert(plan.price_minor, &plan.currency, currency, self.clock.now())
    }

    // ---- payment intents ----

    /// Creates a PENDING intent priced from the plan. A caller-supplied
    /// idempotency key that already names an intent returns that intent
    /// unchanged, so client or network retries never open a second charge.
    pub async fn create_intent(
        &self,
        user_id: i64,
        plan_id: &str,
        method: PaymentMethod,
        idempotency_key: Option<Uuid>,
    ) -> EngineResult<PaymentIntent> {
        let plan = self.catalog.get(plan_id)?.clone();
        if let Some(key) = idempotency_key {
            if let Some(existing) = self.store.intent(key).await? {
                return Ok(existing);
            }
        }

        let intent = PaymentIntent {
            intent_id: idempotency_key.unwrap_or_else(Uuid::new_v4),
            user_id,
            plan_id: plan.id.clone(),
            amount_minor: plan.price_minor,
            currency: plan.currency.clone(),
            method,
            status: IntentStatus::Pending,
            created_at: self.clock.now(),
            confirmed_at: None,
            external_ref: None,
            fail_reason: None,
        };

        match self.store.insert_intent(intent.clone()).await {
            Ok(()) => {
                info!(
                    intent = %intent.intent_id,
                    user_id,
                    plan = %plan.id,
                    method = %intent.method,
                    "created payment intent"
                );
                Ok(intent)
            }
            // Lost an insert race on the same key; the stored intent wins.
            Err(EngineError::DuplicateEntry(_)) => self.get_intent(intent.intent_id).await,
            Err(err) => Err(err),
        }
    }

    /// Expires PENDING intents older than `max_age`. Terminal, no ledger
    /// effect. The PENDING-guarded CAS means an intent mid-confirmation can
    /// never be expired out from under the confirmer.
    pub async fn expire_stale_pending(&self, max_age: Duration) -> EngineResult<u64> {
        let cutoff = self.clock.now() - max_age;
        let stale = self.store.pending_intents_older_than(cutoff).await?;
        let mut expired = 0;
        for intent in stale {
            if self.store.expire_intent_if_pending(intent.intent_id).await? {
                expired += 1;
                info!(
                    intent = %intent.intent_id,
                    user_id = intent.user_id,
                    "expired stale pending intent"
                );
            }
        }
        Ok(expired)
    }

    // ---- reconciliation ----

    /// Applies an external confirmation exactly once. Redelivery with the same
    /// external ref succeeds, completing any step a previous attempt left
    /// undone; a different ref on an already-confirmed intent is a
    /// data-integrity anomaly.
    pub async fn confirm(&self, intent_id: Uuid, external_ref: &str) -> EngineResult<Subscription> {
        let intent = self.get_intent(intent_id).await?;
        match intent.status {
            IntentStatus::Confirmed => {
                return self.resolve_confirmed(&intent, external_ref).await;
            }
            IntentStatus::Failed | IntentStatus::Expired => {
                return Err(EngineError::StaleExpiredIntent {
                    intent_id,
                    status: intent.status,
                });
            }
            IntentStatus::Pending => {}
        }

        let guard = self.locks.acquire(intent.user_id).await;
        let now = self.clock.now();
        if !self
            .store
            .confirm_intent_if_pending(intent_id, external_ref, now)
            .await?
        {
            // Lost the CAS; someone else moved the intent. Re-read and resolve
            // outside the lock, since resolution re-acquires it.
            drop(guard);
            let current = self.get_intent(intent_id).await?;
            return match current.status {
                IntentStatus::Confirmed => self.resolve_confirmed(&current, external_ref).await,
                status => Err(EngineError::StaleExpiredIntent { intent_id, status }),
            };
        }

        let plan = self.catalog.get(&intent.plan_id)?;
        match self
            .store
            .append_entry(self.credit_entry(&intent, plan.duration_days, now))
            .await
        {
            Ok(_) | Err(EngineError::DuplicateEntry(_)) => {}
            // The intent is already CONFIRMED; the redelivered confirmation or
            // repair() resumes from here once storage is back.
            Err(err) => return Err(err),
        }

        let sub = self
            .credit_locked(intent.user_id, &intent.plan_id, plan.duration_days, now)
            .await?;
        info!(
            intent = %intent_id,
            user_id = intent.user_id,
            external_ref,
            expires_at = ?sub.expires_at,
            "payment confirmed and credited"
        );
        Ok(sub)
    }

    /// Redelivery with the matching ref resumes the unit of work rather than
    /// assuming it finished: a storage failure after the CONFIRMED marker can
    /// leave the ledger entry or the credit missing, and the retried delivery
    /// is what completes them.
    async fn resolve_confirmed(
        &self,
        intent: &PaymentIntent,
        external_ref: &str,
    ) -> EngineResult<Subscription> {
        if intent.external_ref.as_deref() != Some(external_ref) {
            return Err(EngineError::ConflictingConfirmation {
                intent_id: intent.intent_id,
                existing: intent.external_ref.clone().unwrap_or_default(),
                incoming: external_ref.to_string(),
            });
        }
        let _guard = self.locks.acquire(intent.user_id).await;
        self.complete_confirmed_locked(intent).await
    }

    /// Finishes the remaining steps of a confirmed intent: the ledger entry if
    /// it never landed, then the subscription row if it lags the ledger.
    /// Caller must hold the user's lock.
    async fn complete_confirmed_locked(
        &self,
        intent: &PaymentIntent,
    ) -> EngineResult<Subscription> {
        let ledger = self.store.ledger_for_user(intent.user_id).await?;
        if !ledger
            .iter()
            .any(|entry| entry.intent_id == Some(intent.intent_id))
        {
            let plan = self.catalog.get(&intent.plan_id)?;
            let created_at = intent.confirmed_at.unwrap_or_else(|| self.clock.now());
            match self
                .store
                .append_entry(self.credit_entry(intent, plan.duration_days, created_at))
                .await
            {
                Ok(_) => warn!(
                    intent = %intent.intent_id,
                    user_id = intent.user_id,
                    "completed missing ledger entry for confirmed intent"
                ),
                Err(EngineError::DuplicateEntry(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let (sub, _) = self.sync_with_ledger(intent.user_id).await?;
        Ok(sub)
    }

    /// Replays the user's ledger and persists the derived subscription when the
    /// stored row disagrees. Returns the authoritative subscription and whether
    /// a drift was fixed. Caller must hold the user's lock.
    async fn sync_with_ledger(&self, user_id: i64) -> EngineResult<(Subscription, bool)> {
        let entries = self.store.ledger_for_user(user_id).await?;
        let now = self.clock.now();
        let derived = subscription::replay(user_id, &entries, now, self.config.warning_window);
        let persisted = self.store.subscription(user_id).await?;
        let drifted = persisted
            .as_ref()
            .map(|sub| sub.expires_at != derived.expires_at)
            .unwrap_or(derived.expires_at.is_some());
        if !drifted {
            return Ok((persisted.unwrap_or(derived), false));
        }
        let was_live = persisted
            .as_ref()
            .and_then(|sub| sub.expires_at)
            .map(|expires| expires > now)
            .unwrap_or(false);
        let merged = Subscription {
            last_notified_status: persisted
                .and_then(|sub| sub.last_notified_status)
                .or(Some(derived.status)),
            ..derived
        };
        self.store.upsert_subscription(merged.clone()).await?;
        warn!(user_id, expires_at = ?merged.expires_at, "subscription re-derived from ledger");
        if !was_live && merged.expires_at.map(|expires| expires > now).unwrap_or(false) {
            self.emit(NotificationEvent {
                user_id,
                kind: NotificationKind::Activated,
                plan_id: merged.plan_id.clone(),
                expires_at: merged.expires_at,
            })
            .await;
        }
        Ok((merged, true))
    }

    fn credit_entry(
        &self,
        intent: &PaymentIntent,
        credited_days: i64,
        created_at: DateTime<Utc>,
    ) -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::new_v4(),
            user_id: intent.user_id,
            intent_id: Some(intent.intent_id),
            plan_id: Some(intent.plan_id.clone()),
            credited_days,
            amount_minor: intent.amount_minor,
            currency: intent.currency.clone(),
            kind: LedgerKind::Credit,
            actor: SYSTEM_ACTOR.to_string(),
            created_at,
        }
    }

    /// PENDING -> FAILED, terminal, no ledger effect. Redelivered failure
    /// reports on an already-failed intent are idempotent.
    pub async fn fail_intent(&self, intent_id: Uuid, reason: &str) -> EngineResult<()> {
        if self.store.fail_intent_if_pending(intent_id, reason).await? {
            info!(intent = %intent_id, reason, "payment intent failed");
            return Ok(());
        }
        let current = self.get_intent(intent_id).await?;
        match current.status {
            IntentStatus::Failed => Ok(()),
            status => Err(EngineError::StaleExpiredIntent { intent_id, status }),
        }
    }

    // ---- admin and audit paths ----

    /// Admin crediting bypasses intents: a MANUAL_ADJUSTMENT entry tagged with
    /// the admin's actor id, then the same entitlement update a payment gets.
    pub async fn extend_subscription(
        &self,
        user_id: i64,
        plan_id: &str,
        days: i64,
        actor: &str,
    ) -> EngineResult<Subscription> {
        let plan = self.catalog.get(plan_id)?.clone();
        let _guard = self.locks.acquire(user_id).await;
        let now = self.clock.now();
        let entry = LedgerEntry {
            entry_id: Uuid::new_v4(),
            user_id,
            intent_id: None,
            plan_id: Some(plan.id.clone()),
            credited_days: days,
            amount_minor: 0,
            currency: plan.currency.clone(),
            kind: LedgerKind::ManualAdjustment,
            actor: actor.to_string(),
            created_at: now,
        };
        self.store.append_entry(entry).await?;
        let sub = self.credit_locked(user_id, plan_id, days, now).await?;
        info!(user_id, plan = %plan_id, days, actor, "subscription extended by admin");
        Ok(sub)
    }

    /// Ledger-only reversal of a confirmed payment. Does not shorten a
    /// credited period.
    pub async fn refund(&self, intent_id: Uuid, actor: &str) -> EngineResult<LedgerEntry> {
        let intent = self.get_intent(intent_id).await?;
        if intent.status != IntentStatus::Confirmed {
            return Err(EngineError::StaleExpiredIntent {
                intent_id,
                status: intent.status,
            });
        }
        let _guard = self.locks.acquire(intent.user_id).await;
        let entry = LedgerEntry {
            entry_id: Uuid::new_v4(),
            user_id: intent.user_id,
            intent_id: None,
            plan_id: Some(intent.plan_id.clone()),
            credited_days: 0,
            amount_minor: intent.amount_minor,
            currency: intent.currency.clone(),
            kind: LedgerKind::Refund,
            actor: actor.to_string(),
            created_at: self.clock.now(),
        };
        self.store.append_entry(entry.clone()).await?;
        warn!(intent = %intent_id, user_id = intent.user_id, actor, "payment refunded (ledger only)");
        Ok(entry)
    }

    // ---- recovery ----

    /// Completes confirm-and-credit units interrupted between their steps: any
    /// CONFIRMED intent without a ledger entry gets its entry appended, and the
    /// owner's subscription is re-derived from the replayed ledger. Safe to run
    /// at any time; run at startup.
    pub async fn repair(&self) -> EngineResult<u64> {
        let confirmed = self.store.confirmed_intents().await?;
        let mut by_user: BTreeMap<i64, Vec<PaymentIntent>> = BTreeMap::new();
        for intent in confirmed {
            by_user.entry(intent.user_id).or_default().push(intent);
        }

        let mut repaired = 0;
        for (user_id, intents) in by_user {
            let _guard = self.locks.acquire(user_id).await;
            let ledger = self.store.ledger_for_user(user_id).await?;
            let known: HashSet<Uuid> = ledger.iter().filter_map(|entry| entry.intent_id).collect();

            let mut appended = false;
            for intent in intents {
                if known.contains(&intent.intent_id) {
                    continue;
                }
                let plan = match self.catalog.get(&intent.plan_id) {
                    Ok(plan) => plan,
                    Err(err) => {
                        error!(?err, intent = %intent.intent_id, "cannot repair intent with unknown plan");
                        continue;
                    }
                };
                let created_at = intent.confirmed_at.unwrap_or_else(|| self.clock.now());
                match self
                    .store
                    .append_entry(self.credit_entry(&intent, plan.duration_days, created_at))
                    .await
                {
                    Ok(_) => {
                        appended = true;
                        warn!(
                            intent = %intent.intent_id,
                            user_id,
                            "repaired missing ledger entry for confirmed intent"
                        );
                    }
                    Err(EngineError::DuplicateEntry(_)) => {}
                    Err(err) => return Err(err),
                }
            }

            // The subscription row can lag even when every entry already
            // landed, so drift is checked for every owner of confirmed intents.
            let (_, drifted) = self.sync_with_ledger(user_id).await?;
            if appended || drifted {
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    // ---- entitlement ----

    /// Recomputes one user's status from the stored expiry, emitting at most
    /// one notification per transition into EXPIRING_SOON or EXPIRED.
    pub async fn recompute(&self, user_id: i64) -> EngineResult<Option<Subscription>> {
        let _guard = self.locks.acquire(user_id).await;
        let Some(sub) = self.store.subscription(user_id).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        let Some(mut updated) = subscription::recompute(&sub, now, self.config.warning_window)
        else {
            return Ok(None);
        };

        let kind = match updated.status {
            SubscriptionStatus::ExpiringSoon => Some(NotificationKind::ExpiringSoon),
            SubscriptionStatus::Expired => Some(NotificationKind::Expired),
            _ => None,
        };
        let should_notify =
            kind.is_some() && sub.last_notified_status != Some(updated.status);
        if should_notify {
            updated.last_notified_status = Some(updated.status);
        }
        self.store.upsert_subscription(updated.clone()).await?;
        if should_notify {
            if let Some(kind) = kind {
                self.emit(NotificationEvent {
                    user_id,
                    kind,
                    plan_id: updated.plan_id.clone(),
                    expires_at: updated.expires_at,
                })
                .await;
            }
        }
        Ok(Some(updated))
    }

    /// Caller must hold the user's lock. `now` is the same instant recorded on
    /// the ledger entry, keeping the stored expiry byte-equal with replay.
    async fn credit_locked(
        &self,
        user_id: i64,
        plan_id: &str,
        duration_days: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<Subscription> {
        let existing = self.store.subscription(user_id).await?;
        let outcome = subscription::apply_credit(
            existing.as_ref(),
            user_id,
            plan_id,
            duration_days,
            now,
            self.config.warning_window,
        );
        self.store
            .upsert_subscription(outcome.subscription.clone())
            .await?;
        if outcome.activated {
            self.emit(NotificationEvent {
                user_id,
                kind: NotificationKind::Activated,
                plan_id: plan_id.to_string(),
                expires_at: outcome.subscription.expires_at,
            })
            .await;
        }
        Ok(outcome.subscription)
    }

    async fn emit(&self, event: NotificationEvent) {
        if let Err(err) = self.notifier.notify(event).await {
            warn!(?err, "failed to deliver notification");
        }
    }
}
