//! Persistence for [`PollingState`].
//!
//! Both stores serialize the full state as JSON, so what is loaded is always
//! exactly what a save round-tripped.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::state::PollingState;
use crate::types::FlowPollingStatus;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, tx_id: &str) -> Result<Option<PollingState>, StoreError>;

    /// Insert or replace.
    async fn save(&self, state: &PollingState) -> Result<(), StoreError>;

    /// Whether a record was removed.
    async fn delete(&self, tx_id: &str) -> Result<bool, StoreError>;

    async fn list_by_status(&self, status: FlowPollingStatus) -> Result<Vec<PollingState>, StoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, tx_id: &str) -> Result<Option<PollingState>, StoreError> {
        let states = self.states.read().await;
        states
            .get(tx_id)
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .transpose()
    }

    async fn save(&self, state: &PollingState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        self.states.write().await.insert(state.tx_id.clone(), json);
        Ok(())
    }

    async fn delete(&self, tx_id: &str) -> Result<bool, StoreError> {
        Ok(self.states.write().await.remove(tx_id).is_some())
    }

    async fn list_by_status(&self, status: FlowPollingStatus) -> Result<Vec<PollingState>, StoreError> {
        let states = self.states.read().await;
        let mut out = Vec::new();
        for json in states.values() {
            let state: PollingState = serde_json::from_str(json)?;
            if state.flow_status == status {
                out.push(state);
            }
        }
        out.sort_by_key(|s| s.started_at);
        Ok(out)
    }
}

// ============================================================================
// Postgres
// ============================================================================

/// Postgres-backed store; one JSONB row per flow in `polling_states`.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool of at most `max_connections`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations (uses the migration files in migrations/)
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self, tx_id: &str) -> Result<Option<PollingState>, StoreError> {
        let row = sqlx::query_as::<_, (Json<PollingState>,)>(
            r#"SELECT state FROM polling_states WHERE tx_id = $1"#,
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(state),)| state))
    }

    async fn save(&self, state: &PollingState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO polling_states (tx_id, flow_type, flow_status, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tx_id) DO UPDATE
            SET flow_status = EXCLUDED.flow_status,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.tx_id)
        .bind(state.flow_type.as_str())
        .bind(state.flow_status.as_str())
        .bind(Json(state))
        .bind(state.started_at)
        .bind(state.last_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, tx_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(r#"DELETE FROM polling_states WHERE tx_id = $1"#)
            .bind(tx_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_status(&self, status: FlowPollingStatus) -> Result<Vec<PollingState>, StoreError> {
        let rows = sqlx::query_as::<_, (Json<PollingState>,)>(
            r#"SELECT state FROM polling_states WHERE flow_status = $1 ORDER BY created_at"#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(state),)| state).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FlowMetadata;
    use crate::state::TrackRequest;
    use crate::types::FlowType;
    use chrono::{Duration, Utc};

    fn state(tx_id: &str, status: FlowPollingStatus) -> PollingState {
        let now = Utc::now();
        let mut state = PollingState::new(
            TrackRequest {
                tx_id: tx_id.to_string(),
                flow_type: FlowType::Deposit,
                metadata: FlowMetadata {
                    amount: Some(u128::MAX),
                    ..Default::default()
                },
                chain_params: Default::default(),
                timeout_secs: None,
            },
            now + Duration::hours(1),
            now,
        );
        state.flow_status = status;
        state
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();
        let original = state("0x01", FlowPollingStatus::Pending);
        store.save(&original).await.unwrap();

        let loaded = store.load("0x01").await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(store.load("0x02").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_list_and_delete() {
        let store = MemoryStateStore::new();
        store.save(&state("a", FlowPollingStatus::Pending)).await.unwrap();
        store.save(&state("b", FlowPollingStatus::Success)).await.unwrap();
        store.save(&state("c", FlowPollingStatus::Pending)).await.unwrap();

        let pending = store.list_by_status(FlowPollingStatus::Pending).await.unwrap();
        let mut ids: Vec<_> = pending.iter().map(|s| s.tx_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(
            store.list_by_status(FlowPollingStatus::Pending).await.unwrap().len(),
            1
        );
    }
}
