//! # Result store
//!
//! Key-value persistence for `SelectionResult`s keyed by event identity.
//!
//! The only write primitive is a native conditional write ("write if absent"): a
//! redelivered event whose result already exists is recognised by the store itself,
//! never by a read-then-write pair that could race under concurrent redelivery.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::selection::{SelectionResult, SelectionRow};

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The result was persisted by this call.
    Written,
    /// A result for the same key was already persisted. Treated as success by callers.
    AlreadyExists,
}

/// Errors raised by a `ResultStore`, pre-classified by whether a retry can help.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("result store is temporarily unavailable: {0}")]
    Transient(String),
    #[error("result store rejected the operation: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        if is_transient_sqlx_error(&error) {
            StoreError::Transient(error.to_string())
        } else {
            StoreError::Permanent(error.to_string())
        }
    }
}

/// Whether retrying the same statement later could succeed.
///
/// SQLSTATE classes: 08 connection exception, 40 transaction rollback (serialization
/// failure, deadlock), 53 insufficient resources, 57 operator intervention.
pub fn is_transient_sqlx_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db_error) => db_error
            .code()
            .and_then(|code| code.get(..2).map(|class| class.to_owned()))
            .map(|class| matches!(class.as_str(), "08" | "40" | "53" | "57"))
            .unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist `result` under its key only if no result exists for that key yet.
    /// Must be atomic: a result is either fully persisted or not at all.
    async fn write_if_absent(&self, result: &SelectionResult) -> Result<WriteStatus, StoreError>;

    async fn read(&self, event_id: &str) -> Result<Option<SelectionResult>, StoreError>;
}

/// A `ResultStore` backed by a PostgreSQL table with `event_id` as primary key.
#[derive(Clone)]
pub struct PgResultStore {
    table: String,
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn write_if_absent(&self, result: &SelectionResult) -> Result<WriteStatus, StoreError> {
        // The primary key makes ON CONFLICT DO NOTHING our conditional write.
        let base_query = format!(
            r#"
INSERT INTO "{0}"
    (event_id, content_category, winning_advertiser_id, winning_bid_amount,
     winning_score, score_margin, policy, event_timestamp, processed_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (event_id) DO NOTHING
            "#,
            &self.table
        );

        let query_result = sqlx::query(&base_query)
            .bind(result.key())
            .bind(&result.content_category)
            .bind(result.winning_advertiser_id())
            .bind(result.winner.as_ref().map(|w| w.bid_amount))
            .bind(result.winning_score)
            .bind(result.score_margin)
            .bind(&result.policy)
            .bind(result.event_timestamp)
            .bind(result.processed_at)
            .execute(&self.pool)
            .await?;

        match query_result.rows_affected() {
            0 => Ok(WriteStatus::AlreadyExists),
            _ => Ok(WriteStatus::Written),
        }
    }

    async fn read(&self, event_id: &str) -> Result<Option<SelectionResult>, StoreError> {
        let base_query = format!(r#"SELECT * FROM "{0}" WHERE event_id = $1"#, &self.table);

        let row: Option<SelectionRow> = sqlx::query_as(&base_query)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(SelectionResult::from))
    }
}

/// An in-process `ResultStore`. Used for local runs and tests.
#[derive(Default)]
pub struct MemoryResultStore {
    results: Mutex<HashMap<String, SelectionResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn write_if_absent(&self, result: &SelectionResult) -> Result<WriteStatus, StoreError> {
        let mut results = self
            .results
            .lock()
            .map_err(|_| StoreError::Permanent("poisoned result store lock".to_owned()))?;

        match results.entry(result.key().to_owned()) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(WriteStatus::AlreadyExists),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(result.clone());
                Ok(WriteStatus::Written)
            }
        }
    }

    async fn read(&self, event_id: &str) -> Result<Option<SelectionResult>, StoreError> {
        let results = self
            .results
            .lock()
            .map_err(|_| StoreError::Permanent("poisoned result store lock".to_owned()))?;

        Ok(results.get(event_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::WinningBid;
    use chrono::{TimeZone, Utc};

    fn selection_result(event_id: &str, advertiser_id: &str) -> SelectionResult {
        SelectionResult {
            event_id: event_id.to_owned(),
            content_category: "sports".to_owned(),
            winner: Some(WinningBid {
                advertiser_id: advertiser_id.to_owned(),
                bid_amount: 3.5,
            }),
            winning_score: 6.7375,
            score_margin: 0.9625,
            policy: "quality_adjusted".to_owned(),
            event_timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 20, 15, 0).unwrap(),
            processed_at: Utc.with_ymd_and_hms(2025, 3, 10, 20, 15, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_second_write_for_same_key_is_already_exists() {
        let store = MemoryResultStore::new();

        let first = store
            .write_if_absent(&selection_result("opp-1", "adv_001"))
            .await
            .expect("failed to write result");
        // Different content under the same key must not replace the first result.
        let second = store
            .write_if_absent(&selection_result("opp-1", "adv_999"))
            .await
            .expect("failed to write result");

        assert_eq!(first, WriteStatus::Written);
        assert_eq!(second, WriteStatus::AlreadyExists);
        assert_eq!(store.len(), 1);

        let stored = store
            .read("opp-1")
            .await
            .expect("failed to read result")
            .expect("result is missing");
        assert_eq!(stored.winning_advertiser_id(), Some("adv_001"));
    }

    #[tokio::test]
    async fn test_concurrent_writes_persist_exactly_one_result() {
        let store = std::sync::Arc::new(MemoryResultStore::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .write_if_absent(&selection_result("opp-race", &format!("adv_{i}")))
                        .await
                })
            })
            .collect();

        let mut written = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == WriteStatus::Written {
                written += 1;
            }
        }

        assert_eq!(written, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sqlx_error_classification() {
        assert!(is_transient_sqlx_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_sqlx_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_sqlx_error(&sqlx::Error::RowNotFound));
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
    async fn test_pg_write_if_absent_is_idempotent(db: PgPool) {
        let store = PgResultStore::new("selection_results", db);

        let first = store
            .write_if_absent(&selection_result("opp-pg", "adv_001"))
            .await
            .expect("failed to write result");
        let second = store
            .write_if_absent(&selection_result("opp-pg", "adv_002"))
            .await
            .expect("failed to write result");

        assert_eq!(first, WriteStatus::Written);
        assert_eq!(second, WriteStatus::AlreadyExists);

        let stored = store
            .read("opp-pg")
            .await
            .expect("failed to read result")
            .expect("result is missing");
        assert_eq!(stored, selection_result("opp-pg", "adv_001"));
    }
}
