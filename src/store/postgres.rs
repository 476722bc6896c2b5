use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    IntentStatus, LedgerEntry, LedgerKind, PaymentIntent, PaymentMethod, Subscription,
    SubscriptionStatus,
};
use crate::store::Store;

const UNIQUE_VIOLATION: &str = "23505";

/// Postgres-backed store. Ledger uniqueness is enforced by a partial unique
/// index on `intent_id`; status transitions are guarded WHERE clauses so the
/// row-level CAS holds across processes.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

fn parse_failure(column: &str, raw: &str) -> EngineError {
    EngineError::StorageUnavailable(format!("unrecognized {column} value `{raw}`"))
}

fn entry_from_row(row: &PgRow) -> EngineResult<LedgerEntry> {
    let kind_raw: String = row.get("kind");
    let kind = LedgerKind::parse(&kind_raw).ok_or_else(|| parse_failure("kind", &kind_raw))?;
    Ok(LedgerEntry {
        entry_id: row.get("entry_id"),
        user_id: row.get("user_id"),
        intent_id: row.get("intent_id"),
        plan_id: row.get("plan_id"),
        credited_days: row.get("credited_days"),
        amount_minor: row.get("amount_minor"),
        currency: row.get("currency"),
        kind,
        actor: row.get("actor"),
        created_at: row.get("created_at"),
    })
}

fn intent_from_row(row: &PgRow) -> EngineResult<PaymentIntent> {
    let method_raw: String = row.get("method");
    let status_raw: String = row.get("status");
    Ok(PaymentIntent {
        intent_id: row.get("intent_id"),
        user_id: row.get("user_id"),
        plan_id: row.get("plan_id"),
        amount_minor: row.get("amount_minor"),
        currency: row.get("currency"),
        method: PaymentMethod::parse(&method_raw)
            .ok_or_else(|| parse_failure("method", &method_raw))?,
        status: IntentStatus::parse(&status_raw)
            .ok_or_else(|| parse_failure("status", &status_raw))?,
        created_at: row.get("created_at"),
        confirmed_at: row.get("confirmed_at"),
        external_ref: row.get("external_ref"),
        fail_reason: row.get("fail_reason"),
    })
}

fn subscription_from_row(row: &PgRow) -> EngineResult<Subscription> {
    let status_raw: String = row.get("status");
    let last_notified_raw: Option<String> = row.get("last_notified_status");
    let last_notified_status = match last_notified_raw {
        Some(raw) => Some(
            SubscriptionStatus::parse(&raw)
                .ok_or_else(|| parse_failure("last_notified_status", &raw))?,
        ),
        None => None,
    };
    Ok(Subscription {
        user_id: row.get("user_id"),
        plan_id: row.get("plan_id"),
        status: SubscriptionStatus::parse(&status_raw)
            .ok_or_else(|| parse_failure("status", &status_raw))?,
        expires_at: row.get("expires_at"),
        renewed_count: row.get("renewed_count"),
        last_notified_status,
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl Store for PgStore {
    async fn append_entry(&self, entry: LedgerEntry) -> EngineResult<Uuid> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                entry_id, user_id, intent_id, plan_id, credited_days,
                amount_minor, currency, kind, actor, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.entry_id)
        .bind(entry.user_id)
        .bind(entry.intent_id)
        .bind(&entry.plan_id)
        .bind(entry.credited_days)
        .bind(entry.amount_minor)
        .bind(&entry.currency)
        .bind(entry.kind.as_str())
        .bind(&entry.actor)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(entry.entry_id),
            Err(err) if is_unique_violation(&err) => Err(EngineError::DuplicateEntry(
                entry.intent_id.unwrap_or_else(Uuid::nil),
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn ledger_for_user(&self, user_id: i64) -> EngineResult<Vec<LedgerEntry>> {
        let rows = sqlx::query("SELECT * FROM ledger_entries WHERE user_id = $1 ORDER BY seq")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn export_ledger(&self) -> EngineResult<Vec<LedgerEntry>> {
        let rows = sqlx::query("SELECT * FROM ledger_entries ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn insert_intent(&self, intent: PaymentIntent) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_intents (
                intent_id, user_id, plan_id, amount_minor, currency,
                method, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(intent.intent_id)
        .bind(intent.user_id)
        .bind(&intent.plan_id)
        .bind(intent.amount_minor)
        .bind(&intent.currency)
        .bind(intent.method.as_str())
        .bind(intent.status.as_str())
        .bind(intent.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(EngineError::DuplicateEntry(intent.intent_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn intent(&self, intent_id: Uuid) -> EngineResult<Option<PaymentIntent>> {
        let row = sqlx::query("SELECT * FROM payment_intents WHERE intent_id = $1")
            .bind(intent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(intent_from_row).transpose()
    }

    async fn pending_intents_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EngineResult<Vec<PaymentIntent>> {
        let rows = sqlx::query(
            "SELECT * FROM payment_intents WHERE status = 'pending' AND created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(intent_from_row).collect()
    }

    async fn confirm_intent_if_pending(
        &self,
        intent_id: Uuid,
        external_ref: &str,
        confirmed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = 'confirmed', external_ref = $2, confirmed_at = $3
            WHERE intent_id = $1 AND status = 'pending'
            "#,
        )
        .bind(intent_id)
        .bind(external_ref)
        .bind(confirmed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_intent_if_pending(&self, intent_id: Uuid, reason: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = 'failed', fail_reason = $2
            WHERE intent_id = $1 AND status = 'pending'
            "#,
        )
        .bind(intent_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_intent_if_pending(&self, intent_id: Uuid) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_intents SET status = 'expired' WHERE intent_id = $1 AND status = 'pending'",
        )
        .bind(intent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn confirmed_intents(&self) -> EngineResult<Vec<PaymentIntent>> {
        let rows = sqlx::query("SELECT * FROM payment_intents WHERE status = 'confirmed'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(intent_from_row).collect()
    }

    async fn subscription(&self, user_id: i64) -> EngineResult<Option<Subscription>> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn upsert_subscription(&self, sub: Subscription) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_id, status, expires_at, renewed_count,
                last_notified_status, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id)
            DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                expires_at = EXCLUDED.expires_at,
                renewed_count = EXCLUDED.renewed_count,
                last_notified_status = EXCLUDED.last_notified_status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(sub.user_id)
        .bind(&sub.plan_id)
        .bind(sub.status.as_str())
        .bind(sub.expires_at)
        .bind(sub.renewed_count)
        .bind(sub.last_notified_status.map(|status| status.as_str()))
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn subscriptions_not_none(&self) -> EngineResult<Vec<Subscription>> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE status <> 'none'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(subscription_from_row).collect()
    }
}
