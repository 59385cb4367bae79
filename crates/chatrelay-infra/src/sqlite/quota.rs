//! SQLite quota ledger.
//!
//! Implements `QuotaLedger` from `chatrelay-core` over three tables:
//! `users` (pay-as-you-go balance), `subscriptions` (per-model plans with a
//! usage counter) and `quota_usage` (one row per collected charge).
//!
//! A request for a model the user has a plan for is charged provisionally at
//! authorization time by bumping the plan's `used` counter; `revert` takes
//! that back. Anything else is billed after the fact by `collect`, at the
//! configured per-model rate per 1k tokens.

use std::collections::HashMap;

use chatrelay_core::pipeline::collaborators::{Authorization, QuotaLedger};
use chatrelay_types::config::ModelRate;
use chatrelay_types::error::{RepositoryError, SessionError};
use chatrelay_types::llm::{ChatMessage, TokenUsage};
use chrono::Utc;
use sqlx::Row;

use super::pool::DatabasePool;

/// Rate used for models without a configured entry.
const DEFAULT_RATE_PER_1K: f32 = 1.0;

pub struct SqliteQuotaLedger {
    pool: DatabasePool,
    rates: HashMap<String, f32>,
}

impl SqliteQuotaLedger {
    pub fn new(pool: DatabasePool, rates: &[ModelRate]) -> Self {
        Self {
            pool,
            rates: rates
                .iter()
                .map(|rate| (rate.model.clone(), rate.quota_per_1k_tokens))
                .collect(),
        }
    }

    fn rate_for(&self, model: &str) -> f32 {
        self.rates.get(model).copied().unwrap_or(DEFAULT_RATE_PER_1K)
    }

    /// Add `amount` to a user's balance, creating the user if needed.
    pub async fn grant(&self, user_id: i64, amount: f32) -> Result<f32, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO users (id, quota, used_quota, created_at) VALUES (?, ?, 0, ?)
               ON CONFLICT (id) DO UPDATE SET quota = quota + excluded.quota"#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        self.balance(user_id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    /// Remaining balance (`quota - used_quota`), or `None` for an unknown user.
    pub async fn balance(&self, user_id: i64) -> Result<Option<f32>, RepositoryError> {
        let row = sqlx::query("SELECT quota - used_quota AS remaining FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            row.try_get::<f64, _>("remaining")
                .map(|v| v as f32)
                .map_err(|e| RepositoryError::Query(e.to_string()))
        })
        .transpose()
    }

    /// Create or replace a per-model plan for a user.
    pub async fn subscribe(
        &self,
        user_id: i64,
        model: &str,
        usage_limit: i64,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO subscriptions (user_id, model, used, usage_limit) VALUES (?, ?, 0, ?)
               ON CONFLICT (user_id, model) DO UPDATE SET usage_limit = excluded.usage_limit"#,
        )
        .bind(user_id)
        .bind(model)
        .bind(usage_limit)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
            other => RepositoryError::Query(other.to_string()),
        })?;

        Ok(())
    }

    /// Plan usage counter, or `None` if the user has no plan for `model`.
    pub async fn subscription_used(
        &self,
        user_id: i64,
        model: &str,
    ) -> Result<Option<i64>, RepositoryError> {
        let row = sqlx::query("SELECT used FROM subscriptions WHERE user_id = ? AND model = ?")
            .bind(user_id)
            .bind(model)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            row.try_get::<i64, _>("used")
                .map_err(|e| RepositoryError::Query(e.to_string()))
        })
        .transpose()
    }

    async fn has_subscription(&self, user_id: i64, model: &str) -> Result<bool, RepositoryError> {
        Ok(self.subscription_used(user_id, model).await?.is_some())
    }
}

fn internal(e: RepositoryError) -> SessionError {
    SessionError::Internal(e.to_string())
}

impl QuotaLedger for SqliteQuotaLedger {
    async fn authorize(
        &self,
        user_id: i64,
        model: &str,
        _messages: &[ChatMessage],
    ) -> Result<Authorization, SessionError> {
        // Charge the plan only while it has room left; one statement, so
        // concurrent requests cannot overrun the limit.
        let charged = sqlx::query(
            "UPDATE subscriptions SET used = used + 1 WHERE user_id = ? AND model = ? AND used < usage_limit",
        )
        .bind(user_id)
        .bind(model)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?
        .rows_affected();

        if charged > 0 {
            return Ok(Authorization {
                covered_by_plan: true,
            });
        }

        match self.balance(user_id).await.map_err(internal)? {
            Some(remaining) if remaining > 0.0 => Ok(Authorization {
                covered_by_plan: false,
            }),
            Some(_) if self.has_subscription(user_id, model).await.map_err(internal)? => Err(
                SessionError::PermissionDenied(format!("subscription limit reached for {model}")),
            ),
            Some(_) => Err(SessionError::PermissionDenied("insufficient quota".to_string())),
            None => Err(SessionError::PermissionDenied(format!(
                "user {user_id} has no quota account"
            ))),
        }
    }

    async fn collect(
        &self,
        user_id: i64,
        model: &str,
        usage: TokenUsage,
    ) -> Result<f32, RepositoryError> {
        let quota = usage.total() as f32 / 1000.0 * self.rate_for(model);

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let updated = sqlx::query("UPDATE users SET used_quota = used_quota + ? WHERE id = ?")
            .bind(quota)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .rows_affected();
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(
            r#"INSERT INTO quota_usage (user_id, model, input_tokens, output_tokens, quota, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(user_id)
        .bind(model)
        .bind(i64::from(usage.input_tokens))
        .bind(i64::from(usage.output_tokens))
        .bind(quota)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(user_id, model, quota, tokens = usage.total(), "quota collected");
        Ok(quota)
    }

    async fn revert(&self, user_id: i64, model: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE subscriptions SET used = used - 1 WHERE user_id = ? AND model = ? AND used > 0",
        )
        .bind(user_id)
        .bind(model)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }
}
