//! Subscription state machine. Pure functions over timestamps so every
//! transition is reproducible from ledger history.

use chrono::{DateTime, Duration, Utc};

use crate::models::{LedgerEntry, LedgerKind, Subscription, SubscriptionStatus};

pub fn status_for(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    warning_window: Duration,
) -> SubscriptionStatus {
    if expires_at <= now {
        SubscriptionStatus::Expired
    } else if expires_at < now + warning_window {
        SubscriptionStatus::ExpiringSoon
    } else {
        SubscriptionStatus::Active
    }
}

#[derive(Debug)]
pub struct CreditOutcome {
    pub subscription: Subscription,
    /// True when this credit took the user from no live entitlement into one,
    /// which is when an ACTIVATED notification is owed.
    pub activated: bool,
}

/// Applies one credited period. A live subscription stacks the new duration on
/// its current expiry so early renewal is never penalized; anything else starts
/// from `now`.
pub fn apply_credit(
    existing: Option<&Subscription>,
    user_id: i64,
    plan_id: &str,
    duration_days: i64,
    now: DateTime<Utc>,
    warning_window: Duration,
) -> CreditOutcome {
    let live_until = existing
        .and_then(|sub| sub.expires_at)
        .filter(|expires| *expires > now);
    let was_live = live_until.is_some();
    let base = live_until.unwrap_or(now);
    let expires_at = base + Duration::days(duration_days);
    let status = status_for(expires_at, now, warning_window);
    let renewed_count = match existing {
        Some(sub) => sub.renewed_count + 1,
        None => 0,
    };

    CreditOutcome {
        subscription: Subscription {
            user_id,
            plan_id: plan_id.to_string(),
            status,
            expires_at: Some(expires_at),
            renewed_count,
            // The credit itself is the notification for this status; the sweep
            // only speaks up on later transitions.
            last_notified_status: Some(status),
            updated_at: now,
        },
        activated: !was_live,
    }
}

/// Re-derives status from the stored expiry. Returns the updated row only when
/// the status actually changed.
pub fn recompute(
    sub: &Subscription,
    now: DateTime<Utc>,
    warning_window: Duration,
) -> Option<Subscription> {
    let expires_at = sub.expires_at?;
    let status = status_for(expires_at, now, warning_window);
    if status == sub.status {
        return None;
    }
    Some(Subscription {
        status,
        updated_at: now,
        ..sub.clone()
    })
}

/// Folds a user's ledger history into the subscription it implies. CREDIT and
/// MANUAL_ADJUSTMENT entries extend entitlement from whichever is later, the
/// running expiry or the entry's own timestamp; REFUND is ledger-only and does
/// not shorten a credited period.
pub fn replay(
    user_id: i64,
    entries: &[LedgerEntry],
    now: DateTime<Utc>,
    warning_window: Duration,
) -> Subscription {
    let mut expires: Option<DateTime<Utc>> = None;
    let mut plan_id = String::new();
    let mut credits: i32 = 0;

    for entry in entries {
        match entry.kind {
            LedgerKind::Credit | LedgerKind::ManualAdjustment => {
                let base = expires
                    .filter(|running| *running > entry.created_at)
                    .unwrap_or(entry.created_at);
                expires = Some(base + Duration::days(entry.credited_days));
                if let Some(plan) = &entry.plan_id {
                    plan_id = plan.clone();
                }
                credits += 1;
            }
            LedgerKind::Refund => {}
        }
    }

    match expires {
        Some(expires_at) => Subscription {
            user_id,
            plan_id,
            status: status_for(expires_at, now, warning_window),
            expires_at: Some(expires_at),
            renewed_count: credits.saturating_sub(1),
            last_notified_status: None,
            updated_at: now,
        },
        None => Subscription::none(user_id, now),
    }
}
