use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc::{channel, Sender};
use tokio::time::{sleep, Duration as TokioDuration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::SubscriptionEngine;
use crate::error::EngineError;
use crate::models::PaymentMethod;

const QUEUE_DEPTH: usize = 64;
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Confirmed,
    Failed,
}

/// Confirmation signal from a payment gateway or chain-polling collaborator.
/// Delivery is at-least-once; the engine deduplicates by external ref.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationEvent {
    pub intent_id: Uuid,
    pub external_ref: String,
    pub status: ConfirmationStatus,
    /// Block confirmations observed so far; only meaningful for crypto intents.
    #[serde(default)]
    pub confirmations: Option<u32>,
    pub observed_at: DateTime<Utc>,
    #[serde(skip)]
    attempts: u32,
}

impl ConfirmationEvent {
    pub fn new(intent_id: Uuid, external_ref: impl Into<String>, status: ConfirmationStatus) -> Self {
        ConfirmationEvent {
            intent_id,
            external_ref: external_ref.into(),
            status,
            confirmations: None,
            observed_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = Some(confirmations);
        self
    }
}

/// key: reconciliation-handle -> enqueue interface for webhook/polling callers
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ConfirmationEvent>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, event: ConfirmationEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|err| anyhow!("failed to enqueue confirmation event: {err}"))
    }
}

/// Spawns the inbound confirmation consumer. Storage failures requeue the
/// event with backoff; conflicting or late confirmations are logged for the
/// operator queue and never auto-resolved.
pub fn start_reconciliation_worker(engine: Arc<SubscriptionEngine>) -> ReconciliationHandle {
    let (tx, mut rx) = channel(QUEUE_DEPTH);
    let requeue = tx.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_event(&engine, &requeue, event).await;
        }
    });
    ReconciliationHandle { sender: tx }
}

async fn handle_event(
    engine: &SubscriptionEngine,
    requeue: &Sender<ConfirmationEvent>,
    mut event: ConfirmationEvent,
) {
    if event.status == ConfirmationStatus::Failed {
        match engine
            .fail_intent(event.intent_id, "provider reported failure")
            .await
        {
            Ok(()) => info!(intent = %event.intent_id, "intent marked failed from provider signal"),
            Err(err) => error!(?err, intent = %event.intent_id, "failure signal could not be applied"),
        }
        return;
    }

    // Crypto confirmations are only applied once the chain poller has seen
    // enough blocks; below the threshold the poller will redeliver later.
    match engine.get_intent(event.intent_id).await {
        Ok(intent) if intent.method == PaymentMethod::Crypto => {
            let required = engine.config().crypto_min_confirmations;
            let seen = event.confirmations.unwrap_or(0);
            if seen < required {
                debug!(
                    intent = %event.intent_id,
                    seen,
                    required,
                    "crypto confirmation below threshold"
                );
                return;
            }
        }
        Ok(_) => {}
        Err(EngineError::StorageUnavailable(msg)) => {
            retry_later(requeue, &mut event, &msg).await;
            return;
        }
        Err(err) => {
            error!(?err, intent = %event.intent_id, "confirmation for unknown intent");
            return;
        }
    }

    match engine.confirm(event.intent_id, &event.external_ref).await {
        Ok(sub) => info!(
            intent = %event.intent_id,
            user_id = sub.user_id,
            status = sub.status.as_str(),
            "confirmation applied"
        ),
        Err(EngineError::StorageUnavailable(msg)) => {
            retry_later(requeue, &mut event, &msg).await;
        }
        Err(err @ EngineError::ConflictingConfirmation { .. })
        | Err(err @ EngineError::StaleExpiredIntent { .. }) => {
            error!(
                ?err,
                intent = %event.intent_id,
                external_ref = %event.external_ref,
                "confirmation requires manual reconciliation"
            );
        }
        Err(err) => error!(?err, intent = %event.intent_id, "failed to apply confirmation"),
    }
}

async fn retry_later(
    requeue: &Sender<ConfirmationEvent>,
    event: &mut ConfirmationEvent,
    reason: &str,
) {
    event.attempts += 1;
    if event.attempts >= MAX_DELIVERY_ATTEMPTS {
        error!(
            intent = %event.intent_id,
            attempts = event.attempts,
            reason,
            "giving up on confirmation; upstream redelivery will retry"
        );
        return;
    }
    warn!(
        intent = %event.intent_id,
        attempts = event.attempts,
        reason,
        "storage unavailable, requeueing confirmation"
    );
    sleep(TokioDuration::from_millis(200 * event.attempts as u64)).await;
    let _ = requeue.send(event.clone()).await;
}
