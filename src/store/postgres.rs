//! # PostgreSQL Negotiation Store
//!
//! ## Architecture: Conditional-update leasing
//!
//! Leases are columns on the `negotiations` row (`leased_by`, `leased_at`,
//! `lease_duration_ms`). Acquisition is always one statement:
//!
//! - **Batch pickup** locks candidate rows with `FOR UPDATE SKIP LOCKED` and
//!   stamps the lease in the same `UPDATE … RETURNING`, so concurrent
//!   schedulers in other processes skip rows another transaction is claiming
//! - **Point lookup** uses `UPDATE … WHERE id = $1 AND <lease free or expired>`
//! - **Save** is an upsert whose `DO UPDATE` only applies when the lease is
//!   absent, expired, or ours; zero affected rows means someone else holds it
//! - A second record for the same counter-party process id and role violates
//!   `uq_negotiations_correlation` and surfaces as `DuplicateCorrelation`
//!
//! All timestamps are bound from the injected clock rather than `now()` so
//! that lease expiry follows the same time source as the rest of the crate.

use super::{Criteria, NegotiationStore};
use crate::clock::SharedClock;
use crate::error::{StoreError, StoreResult};
use crate::models::Negotiation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Unique index on `(correlation_id, negotiation_type)`
const CORRELATION_CONSTRAINT: &str = "uq_negotiations_correlation";

const LEASE_FREE: &str = "(leased_by IS NULL \
    OR leased_at + lease_duration_ms * INTERVAL '1 millisecond' <= $2)";

pub struct PgNegotiationStore {
    pool: PgPool,
    holder: String,
    lease_duration: Duration,
    clock: SharedClock,
}

impl std::fmt::Debug for PgNegotiationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNegotiationStore")
            .field("holder", &self.holder)
            .field("lease_duration", &self.lease_duration)
            .finish_non_exhaustive()
    }
}

impl PgNegotiationStore {
    pub fn new(
        pool: PgPool,
        holder: impl Into<String>,
        lease_duration: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            pool,
            holder: holder.into(),
            lease_duration,
            clock,
        }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))
    }

    fn lease_duration_ms(&self) -> i64 {
        i64::try_from(self.lease_duration.as_millis()).unwrap_or(i64::MAX)
    }

    async fn current_holder(&self, id: &str) -> StoreResult<Option<String>> {
        let holder: Option<Option<String>> =
            sqlx::query_scalar("SELECT leased_by FROM negotiations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(holder.flatten())
    }

    async fn lease_by_id(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Option<Negotiation>> {
        let query = format!(
            r#"
            UPDATE negotiations
            SET leased_by = $1, leased_at = $2, lease_duration_ms = $3
            WHERE id = $4 AND {LEASE_FREE}
            RETURNING payload
            "#
        );

        let leased: Option<Json<Negotiation>> = sqlx::query_scalar(&query)
            .bind(&self.holder)
            .bind(now)
            .bind(self.lease_duration_ms())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(negotiation_id = id, "Failed to lease negotiation: {}", e);
                StoreError::Database(e)
            })?;

        if let Some(Json(negotiation)) = leased {
            return Ok(Some(negotiation));
        }

        match self.current_holder(id).await? {
            Some(holder) => Err(StoreError::LeaseHeld {
                id: id.to_string(),
                holder,
            }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl NegotiationStore for PgNegotiationStore {
    fn lease_holder(&self) -> &str {
        &self.holder
    }

    #[instrument(skip(self), fields(holder = %self.holder))]
    async fn next_not_leased(
        &self,
        batch_size: usize,
        criteria: &Criteria,
    ) -> StoreResult<Vec<Negotiation>> {
        let now = self.clock.now();
        let query = format!(
            r#"
            UPDATE negotiations
            SET leased_by = $1, leased_at = $2, lease_duration_ms = $3
            WHERE id IN (
                SELECT id FROM negotiations
                WHERE state = $4
                  AND ($5::VARCHAR IS NULL OR negotiation_type = $5)
                  AND pending = FALSE
                  AND (retry_at IS NULL OR retry_at <= $2)
                  AND {LEASE_FREE}
                ORDER BY state_timestamp ASC
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload
            "#
        );

        let rows: Vec<Json<Negotiation>> = sqlx::query_scalar(&query)
            .bind(&self.holder)
            .bind(now)
            .bind(self.lease_duration_ms())
            .bind(criteria.state.code())
            .bind(criteria.negotiation_type.map(|t| t.to_string()))
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to lease negotiations: {}", e);
                StoreError::Database(e)
            })?;

        let mut leased: Vec<Negotiation> = rows.into_iter().map(|Json(n)| n).collect();
        leased.sort_by_key(|n| n.state_timestamp());

        debug!(
            leased = leased.len(),
            state = %criteria.state,
            "Leased negotiations for processing"
        );
        Ok(leased)
    }

    async fn save(&self, negotiation: &Negotiation) -> StoreResult<()> {
        let now = self.clock.now();
        let query = format!(
            r#"
            INSERT INTO negotiations (
                id, correlation_id, negotiation_type, state, state_count, state_timestamp,
                pending, retry_at, payload, created_at, updated_at
            )
            VALUES ($3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                correlation_id = EXCLUDED.correlation_id,
                state = EXCLUDED.state,
                state_count = EXCLUDED.state_count,
                state_timestamp = EXCLUDED.state_timestamp,
                pending = EXCLUDED.pending,
                retry_at = EXCLUDED.retry_at,
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at,
                leased_by = NULL,
                leased_at = NULL,
                lease_duration_ms = NULL
            WHERE negotiations.leased_by IS NULL
               OR negotiations.leased_by = $1
               OR negotiations.leased_at
                  + negotiations.lease_duration_ms * INTERVAL '1 millisecond' <= $2
            "#
        );

        let result = sqlx::query(&query)
            .bind(&self.holder)
            .bind(now)
            .bind(negotiation.id())
            .bind(negotiation.correlation_id())
            .bind(negotiation.negotiation_type().to_string())
            .bind(negotiation.state().code())
            .bind(i64::from(negotiation.state_count()))
            .bind(negotiation.state_timestamp())
            .bind(negotiation.is_pending())
            .bind(negotiation.retry_at())
            .bind(Json(negotiation))
            .bind(negotiation.created_at())
            .bind(negotiation.updated_at())
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.constraint() == Some(CORRELATION_CONSTRAINT) => {
                    StoreError::DuplicateCorrelation {
                        correlation_id: negotiation
                            .correlation_id()
                            .unwrap_or_default()
                            .to_string(),
                        negotiation_type: negotiation.negotiation_type().to_string(),
                    }
                }
                other => StoreError::Database(other),
            })?;

        if result.rows_affected() == 0 {
            let holder = self
                .current_holder(negotiation.id())
                .await?
                .unwrap_or_default();
            warn!(
                negotiation_id = negotiation.id(),
                holder = %holder,
                "Save rejected: negotiation leased by another holder"
            );
            return Err(StoreError::LeaseHeld {
                id: negotiation.id().to_string(),
                holder,
            });
        }

        Ok(())
    }

    async fn break_lease(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let query = format!(
            r#"
            UPDATE negotiations
            SET leased_by = NULL, leased_at = NULL, lease_duration_ms = NULL
            WHERE id = $3 AND (leased_by = $1 OR {LEASE_FREE})
            "#
        );

        let result = sqlx::query(&query)
            .bind(&self.holder)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            if let Some(holder) = self.current_holder(id).await? {
                return Err(StoreError::LeaseHeld {
                    id: id.to_string(),
                    holder,
                });
            }
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Negotiation>> {
        let row: Option<Json<Negotiation>> =
            sqlx::query_scalar("SELECT payload FROM negotiations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(n)| n))
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> StoreResult<Option<Negotiation>> {
        let row: Option<Json<Negotiation>> =
            sqlx::query_scalar("SELECT payload FROM negotiations WHERE correlation_id = $1 LIMIT 1")
                .bind(correlation_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(n)| n))
    }

    async fn find_by_id_and_lease(&self, id: &str) -> StoreResult<Option<Negotiation>> {
        self.lease_by_id(id, self.clock.now()).await
    }

    async fn find_by_correlation_id_and_lease(
        &self,
        correlation_id: &str,
    ) -> StoreResult<Option<Negotiation>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM negotiations WHERE correlation_id = $1 LIMIT 1")
                .bind(correlation_id)
                .fetch_optional(&self.pool)
                .await?;

        match id {
            Some(id) => self.lease_by_id(&id, self.clock.now()).await,
            None => Ok(None),
        }
    }
}
