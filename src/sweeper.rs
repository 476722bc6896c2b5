use std::sync::Arc;

use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, warn};

use crate::config;
use crate::engine::SubscriptionEngine;
use crate::error::EngineResult;

/// key: expiry-sweeper -> scheduled entitlement scan
pub fn spawn(engine: Arc<SubscriptionEngine>) {
    let interval = TokioDuration::from_secs(*config::SWEEP_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(&engine).await {
                warn!(?err, "expiry sweep tick failed");
            }
            engine.prune_locks();
        }
    });
}

/// key: stale-intent-expiry -> scheduled PENDING cleanup
pub fn spawn_stale_intent_expiry(engine: Arc<SubscriptionEngine>) {
    let interval = TokioDuration::from_secs(*config::STALE_INTENT_SCAN_INTERVAL_SECS);
    tokio::spawn(async move {
        let max_age = engine.config().stale_intent_max_age;
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.expire_stale_pending(max_age).await {
                Ok(0) => {}
                Ok(expired) => debug!(expired, "stale intent scan complete"),
                Err(err) => warn!(?err, "stale intent scan failed"),
            }
        }
    });
}

/// One idempotent sweep over every tracked subscription. Transitions are
/// recomputed per user under that user's lock; each transition into
/// EXPIRING_SOON or EXPIRED notifies exactly once across sweeps. Returns the
/// number of status transitions applied.
pub async fn process_tick(engine: &SubscriptionEngine) -> EngineResult<u64> {
    let mut transitions = 0;
    for sub in engine.tracked_subscriptions().await? {
        match engine.recompute(sub.user_id).await {
            Ok(Some(updated)) => {
                transitions += 1;
                debug!(
                    user_id = updated.user_id,
                    status = updated.status.as_str(),
                    "subscription transitioned during sweep"
                );
            }
            Ok(None) => {}
            Err(err) => warn!(?err, user_id = sub.user_id, "sweep failed for user"),
        }
    }
    Ok(transitions)
}
