use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

use subledger::catalog::DEFAULT_CATALOG_JSON;
use subledger::{
    ChannelNotifier, CurrencyConverter, EngineConfig, EngineError, EngineResult, LedgerEntry,
    ManualClock, MemoryStore, NotificationEvent, NotificationKind, PaymentIntent, PaymentMethod,
    PlanCatalog, Store, Subscription, SubscriptionEngine, SubscriptionStatus,
};

/// Store wrapper that fails a set number of upcoming writes, exercising the
/// crash windows between the steps of the confirm-and-credit sequence.
struct FlakyStore {
    inner: MemoryStore,
    failing_appends: AtomicU32,
    failing_upserts: AtomicU32,
}

impl FlakyStore {
    fn new() -> Self {
        FlakyStore {
            inner: MemoryStore::new(),
            failing_appends: AtomicU32::new(0),
            failing_upserts: AtomicU32::new(0),
        }
    }

    fn fail_next_append(&self) {
        self.failing_appends.store(1, Ordering::SeqCst);
    }

    fn fail_next_upsert(&self) {
        self.failing_upserts.store(1, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn append_entry(&self, entry: LedgerEntry) -> EngineResult<Uuid> {
        if Self::take(&self.failing_appends) {
            return Err(EngineError::StorageUnavailable(
                "injected append failure".into(),
            ));
        }
        self.inner.append_entry(entry).await
    }

    async fn ledger_for_user(&self, user_id: i64) -> EngineResult<Vec<LedgerEntry>> {
        self.inner.ledger_for_user(user_id).await
    }

    async fn export_ledger(&self) -> EngineResult<Vec<LedgerEntry>> {
        self.inner.export_ledger().await
    }

    async fn insert_intent(&self, intent: PaymentIntent) -> EngineResult<()> {
        self.inner.insert_intent(intent).await
    }

    async fn intent(&self, intent_id: Uuid) -> EngineResult<Option<PaymentIntent>> {
        self.inner.intent(intent_id).await
    }

    async fn pending_intents_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EngineResult<Vec<PaymentIntent>> {
        self.inner.pending_intents_older_than(cutoff).await
    }

    async fn confirm_intent_if_pending(
        &self,
        intent_id: Uuid,
        external_ref: &str,
        confirmed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        self.inner
            .confirm_intent_if_pending(intent_id, external_ref, confirmed_at)
            .await
    }

    async fn fail_intent_if_pending(&self, intent_id: Uuid, reason: &str) -> EngineResult<bool> {
        self.inner.fail_intent_if_pending(intent_id, reason).await
    }

    async fn expire_intent_if_pending(&self, intent_id: Uuid) -> EngineResult<bool> {
        self.inner.expire_intent_if_pending(intent_id).await
    }

    async fn confirmed_intents(&self) -> EngineResult<Vec<PaymentIntent>> {
        self.inner.confirmed_intents().await
    }

    async fn subscription(&self, user_id: i64) -> EngineResult<Option<Subscription>> {
        self.inner.subscription(user_id).await
    }

    async fn upsert_subscription(&self, sub: Subscription) -> EngineResult<()> {
        if Self::take(&self.failing_upserts) {
            return Err(EngineError::StorageUnavailable(
                "injected upsert failure".into(),
            ));
        }
        self.inner.upsert_subscription(sub).await
    }

    async fn subscriptions_not_none(&self) -> EngineResult<Vec<Subscription>> {
        self.inner.subscriptions_not_none().await
    }
}

struct Harness {
    engine: Arc<SubscriptionEngine>,
    store: Arc<FlakyStore>,
    notifications: Receiver<NotificationEvent>,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let store = Arc::new(FlakyStore::new());
    let (notifier, notifications) = ChannelNotifier::new(32);
    let catalog = Arc::new(PlanCatalog::from_json_str(DEFAULT_CATALOG_JSON).unwrap());
    let converter = Arc::new(CurrencyConverter::new(Duration::hours(1)));
    let engine = Arc::new(SubscriptionEngine::new(
        store.clone(),
        clock,
        catalog,
        converter,
        Arc::new(notifier),
        EngineConfig::default(),
    ));
    Harness {
        engine,
        store,
        notifications,
    }
}

fn drain(rx: &mut Receiver<NotificationEvent>) -> Vec<NotificationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn retried_confirm_completes_lost_ledger_append() {
    let mut h = harness();
    let intent = h
        .engine
        .create_intent(7, "basic", PaymentMethod::BankCard, None)
        .await
        .unwrap();

    // The CONFIRMED marker lands, then the ledger append dies.
    h.store.fail_next_append();
    let err = h.engine.confirm(intent.intent_id, "txn-1").await.unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)));
    assert!(h.engine.get_ledger(7).await.unwrap().is_empty());
    assert_eq!(
        h.engine.get_subscription(7).await.unwrap().status,
        SubscriptionStatus::None
    );

    // At-least-once redelivery must finish the unit, not report a no-op.
    let sub = h.engine.confirm(intent.intent_id, "txn-1").await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.expires_at, Some(start_time() + Duration::days(30)));
    assert_eq!(h.engine.get_ledger(7).await.unwrap().len(), 1);

    let events = drain(&mut h.notifications);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, NotificationKind::Activated);
}

#[tokio::test]
async fn retried_confirm_completes_lost_credit() {
    let mut h = harness();
    let intent = h
        .engine
        .create_intent(7, "basic", PaymentMethod::BankCard, None)
        .await
        .unwrap();

    // Marker and ledger entry land, the subscription upsert dies.
    h.store.fail_next_upsert();
    let err = h.engine.confirm(intent.intent_id, "txn-1").await.unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)));
    assert_eq!(h.engine.get_ledger(7).await.unwrap().len(), 1);
    assert_eq!(
        h.engine.get_subscription(7).await.unwrap().status,
        SubscriptionStatus::None
    );

    let sub = h.engine.confirm(intent.intent_id, "txn-1").await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.expires_at, Some(start_time() + Duration::days(30)));
    // The retry credits from the existing entry instead of appending another.
    assert_eq!(h.engine.get_ledger(7).await.unwrap().len(), 1);

    let events = drain(&mut h.notifications);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, NotificationKind::Activated);
}

#[tokio::test]
async fn repair_restores_subscription_when_credit_was_lost() {
    let mut h = harness();
    let intent = h
        .engine
        .create_intent(7, "basic", PaymentMethod::BankCard, None)
        .await
        .unwrap();

    h.store.fail_next_upsert();
    h.engine
        .confirm(intent.intent_id, "txn-1")
        .await
        .unwrap_err();
    assert_eq!(h.engine.get_ledger(7).await.unwrap().len(), 1);

    // Startup repair finds the ledger ahead of the subscription row.
    let repaired = h.engine.repair().await.unwrap();
    assert_eq!(repaired, 1);

    let sub = h.engine.get_subscription(7).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.expires_at, Some(start_time() + Duration::days(30)));

    let events = drain(&mut h.notifications);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, NotificationKind::Activated);

    // Nothing left once the row caught up.
    assert_eq!(h.engine.repair().await.unwrap(), 0);
}
