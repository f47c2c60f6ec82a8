//! Postgres state store integration tests
//!
//! Run with: cargo test --test pg_store_integration -- --ignored --nocapture
//!
//! Prerequisites:
//! - Postgres reachable at DATABASE_URL (migrations are applied by the test)

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use usdc_flow_tracker::error::PollError;
use usdc_flow_tracker::state::{ChainPollParams, PollingState, TrackRequest};
use usdc_flow_tracker::store::{PgStateStore, StateStore};
use usdc_flow_tracker::types::{stages, ChainKey, ChainStage, FlowPollingStatus, FlowType};
use usdc_flow_tracker::FlowMetadata;

async fn store() -> PgStateStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PgStateStore::connect(&url, 2)
        .await
        .expect("Failed to connect to database");
    store.run_migrations().await.expect("Failed to run migrations");
    store
}

fn unique_tx_id(label: &str) -> String {
    format!(
        "0x{}{:x}",
        label,
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

fn state(tx_id: &str) -> PollingState {
    let now = Utc::now();
    let mut chain_params = BTreeMap::new();
    chain_params.insert(
        ChainKey::Evm,
        ChainPollParams {
            tx_hash: Some(tx_id.to_string()),
            ..Default::default()
        },
    );
    PollingState::new(
        TrackRequest {
            tx_id: tx_id.to_string(),
            flow_type: FlowType::Deposit,
            metadata: FlowMetadata {
                amount: Some(u128::MAX),
                recipient: Some("tnam1qtest".to_string()),
                ..Default::default()
            },
            chain_params,
            timeout_secs: None,
        },
        now + Duration::hours(1),
        now,
    )
}

#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_save_load_round_trip() {
    let store = store().await;
    let tx_id = unique_tx_id("a");
    let mut original = state(&tx_id);
    let now = Utc::now();
    let evm = original.chain_mut(ChainKey::Evm);
    evm.add_stages(vec![ChainStage::confirmed(
        stages::EVM_BURN_CONFIRMED,
        Some(tx_id.clone()),
    )]);
    evm.record_success(now);
    original
        .chain_mut(ChainKey::Noble)
        .record_failure(PollError::user_action("forwarding_not_registered", "register"), now);

    store.save(&original).await.unwrap();
    let loaded = store.load(&tx_id).await.unwrap().unwrap();
    assert_eq!(loaded, original);
    assert_eq!(loaded.metadata.amount, Some(u128::MAX));

    assert!(store.delete(&tx_id).await.unwrap());
    assert!(store.load(&tx_id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_upsert_updates_status_index() {
    let store = store().await;
    let tx_id = unique_tx_id("b");
    let mut flow = state(&tx_id);
    store.save(&flow).await.unwrap();

    let pending = store.list_by_status(FlowPollingStatus::Pending).await.unwrap();
    assert!(pending.iter().any(|s| s.tx_id == tx_id));

    flow.flow_status = FlowPollingStatus::Cancelled;
    store.save(&flow).await.unwrap();

    let pending = store.list_by_status(FlowPollingStatus::Pending).await.unwrap();
    assert!(!pending.iter().any(|s| s.tx_id == tx_id));
    let cancelled = store.list_by_status(FlowPollingStatus::Cancelled).await.unwrap();
    assert!(cancelled.iter().any(|s| s.tx_id == tx_id));

    store.delete(&tx_id).await.unwrap();
}
