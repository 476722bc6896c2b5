use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::time::{sleep, Duration as TokioDuration};
use uuid::Uuid;

use subledger::catalog::DEFAULT_CATALOG_JSON;
use subledger::{
    start_reconciliation_worker, ChannelNotifier, ConfirmationEvent, ConfirmationStatus,
    CurrencyConverter, EngineConfig, IntentStatus, ManualClock, MemoryStore, PaymentMethod,
    PlanCatalog, SubscriptionEngine,
};

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn engine() -> Arc<SubscriptionEngine> {
    let clock = Arc::new(ManualClock::new(start_time()));
    let store = Arc::new(MemoryStore::new());
    let (notifier, _notifications) = ChannelNotifier::new(32);
    let catalog = Arc::new(PlanCatalog::from_json_str(DEFAULT_CATALOG_JSON).unwrap());
    let converter = Arc::new(CurrencyConverter::new(Duration::hours(1)));
    Arc::new(SubscriptionEngine::new(
        store,
        clock,
        catalog,
        converter,
        Arc::new(notifier),
        EngineConfig::default(),
    ))
}

async fn wait_for_status(
    engine: &SubscriptionEngine,
    intent_id: Uuid,
    expected: IntentStatus,
) -> bool {
    for _ in 0..100 {
        if engine.get_intent(intent_id).await.unwrap().status == expected {
            return true;
        }
        sleep(TokioDuration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn worker_applies_bank_card_confirmation() {
    let engine = engine();
    let handle = start_reconciliation_worker(engine.clone());
    let intent = engine
        .create_intent(7, "basic", PaymentMethod::BankCard, None)
        .await
        .unwrap();

    handle
        .dispatch(ConfirmationEvent::new(
            intent.intent_id,
            "gw-123",
            ConfirmationStatus::Confirmed,
        ))
        .await
        .unwrap();

    assert!(wait_for_status(&engine, intent.intent_id, IntentStatus::Confirmed).await);
    let ledger = engine.get_ledger(7).await.unwrap();
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn worker_holds_crypto_confirmation_below_threshold() {
    let engine = engine();
    let handle = start_reconciliation_worker(engine.clone());
    let intent = engine
        .create_intent(7, "vip", PaymentMethod::Crypto, None)
        .await
        .unwrap();

    // Default threshold is 3 confirmations; one block is not enough.
    handle
        .dispatch(
            ConfirmationEvent::new(intent.intent_id, "0xdead", ConfirmationStatus::Confirmed)
                .with_confirmations(1),
        )
        .await
        .unwrap();
    sleep(TokioDuration::from_millis(100)).await;
    assert_eq!(
        engine.get_intent(intent.intent_id).await.unwrap().status,
        IntentStatus::Pending
    );

    // The poller redelivers once the chain is deep enough.
    handle
        .dispatch(
            ConfirmationEvent::new(intent.intent_id, "0xdead", ConfirmationStatus::Confirmed)
                .with_confirmations(3),
        )
        .await
        .unwrap();
    assert!(wait_for_status(&engine, intent.intent_id, IntentStatus::Confirmed).await);
    assert_eq!(
        engine
            .get_intent(intent.intent_id)
            .await
            .unwrap()
            .external_ref
            .as_deref(),
        Some("0xdead")
    );
}

#[tokio::test]
async fn worker_marks_intent_failed_on_provider_failure() {
    let engine = engine();
    let handle = start_reconciliation_worker(engine.clone());
    let intent = engine
        .create_intent(7, "basic", PaymentMethod::BankCard, None)
        .await
        .unwrap();

    handle
        .dispatch(ConfirmationEvent::new(
            intent.intent_id,
            "gw-456",
            ConfirmationStatus::Failed,
        ))
        .await
        .unwrap();

    assert!(wait_for_status(&engine, intent.intent_id, IntentStatus::Failed).await);
    assert!(engine.get_ledger(7).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_deliveries_credit_once() {
    let engine = engine();
    let handle = start_reconciliation_worker(engine.clone());
    let intent = engine
        .create_intent(7, "basic", PaymentMethod::BankCard, None)
        .await
        .unwrap();

    for _ in 0..3 {
        handle
            .dispatch(ConfirmationEvent::new(
                intent.intent_id,
                "gw-789",
                ConfirmationStatus::Confirmed,
            ))
            .await
            .unwrap();
    }

    assert!(wait_for_status(&engine, intent.intent_id, IntentStatus::Confirmed).await);
    sleep(TokioDuration::from_millis(100)).await;
    assert_eq!(engine.get_ledger(7).await.unwrap().len(), 1);
}
