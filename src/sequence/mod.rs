//! Surrogate-key sequence service
//!
//! Issues collision-free surrogate keys per dimension. Reservation is a
//! single atomic operation: a contiguous block of `count` keys starting
//! above the dimension's current maximum, so concurrent dimension loads
//! never emit duplicate surrogate keys.
//!
//! The service is injected into loaders rather than living as a process
//! global, so tests substitute the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::KeyAllocationError;

/// Contract: `reserve(dimension, count)` returns the first key of a
/// contiguous reserved block. Failure to read or advance the maximum is
/// fatal to the calling task only.
#[async_trait]
pub trait KeySequenceService: Send + Sync {
    async fn reserve(&self, dimension: &str, count: u32) -> Result<i64, KeyAllocationError>;
}

/// In-memory sequence for tests and dry runs. A single mutex over the
/// per-dimension maxima makes each reservation atomic.
#[derive(Default)]
pub struct InMemoryKeySequence {
    max_keys: Mutex<HashMap<String, i64>>,
}

impl InMemoryKeySequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a dimension's current maximum, e.g. from pre-provisioned rows
    pub async fn seed(&self, dimension: impl Into<String>, max_key: i64) {
        let mut maxima = self.max_keys.lock().await;
        maxima.insert(dimension.into(), max_key);
    }

    pub async fn current_max(&self, dimension: &str) -> i64 {
        let maxima = self.max_keys.lock().await;
        maxima.get(dimension).copied().unwrap_or(0)
    }
}

#[async_trait]
impl KeySequenceService for InMemoryKeySequence {
    async fn reserve(&self, dimension: &str, count: u32) -> Result<i64, KeyAllocationError> {
        let mut maxima = self.max_keys.lock().await;
        let max = maxima.entry(dimension.to_string()).or_insert(0);
        let start = *max + 1;
        *max += i64::from(count);
        Ok(start)
    }
}

/// Postgres-backed sequence over `etl_key_sequence(dimension_name, max_key)`.
///
/// The upsert advances and reads the maximum in one statement, which is the
/// atomicity the contract requires.
#[cfg(feature = "database")]
pub struct PostgresKeySequence {
    pool: sqlx::PgPool,
}

#[cfg(feature = "database")]
impl PostgresKeySequence {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl KeySequenceService for PostgresKeySequence {
    async fn reserve(&self, dimension: &str, count: u32) -> Result<i64, KeyAllocationError> {
        let reserved: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO etl_key_sequence (dimension_name, max_key)
            VALUES ($1, $2)
            ON CONFLICT (dimension_name)
            DO UPDATE SET max_key = etl_key_sequence.max_key + EXCLUDED.max_key
            RETURNING max_key
            "#,
        )
        .bind(dimension)
        .bind(i64::from(count))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| KeyAllocationError::ReservationFailed {
            dimension: dimension.to_string(),
            count,
            message: e.to_string(),
        })?;

        Ok(reserved.0 - i64::from(count) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_blocks_are_contiguous() {
        let sequence = InMemoryKeySequence::new();
        let first = sequence.reserve("party", 3).await.unwrap();
        let second = sequence.reserve("party", 2).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 4);
        assert_eq!(sequence.current_max("party").await, 5);
    }

    #[tokio::test]
    async fn test_dimensions_are_independent() {
        let sequence = InMemoryKeySequence::new();
        sequence.seed("country", 1000).await;

        assert_eq!(sequence.reserve("country", 1).await.unwrap(), 1001);
        assert_eq!(sequence.reserve("party", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overlap() {
        let sequence = Arc::new(InMemoryKeySequence::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let seq = Arc::clone(&sequence);
            handles.push(tokio::spawn(
                async move { seq.reserve("party", 10).await },
            ));
        }

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap().unwrap());
        }

        starts.sort_unstable();
        starts.dedup();
        assert_eq!(starts.len(), 16, "every block start must be distinct");
        for window in starts.windows(2) {
            assert!(window[1] - window[0] >= 10, "blocks must not overlap");
        }
    }
}
