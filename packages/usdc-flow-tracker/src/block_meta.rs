//! Best-effort block metadata enrichment.
//!
//! Height and timestamp are decoration on a poll result. A failure here is
//! logged and the caller gets whatever subset is known, never an error.

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::BoundedTtlCache;

/// Anything that can look up a block's timestamp by height.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Unix seconds, or None if the block is unknown.
    async fn block_timestamp(&self, height: u64) -> Result<Option<i64>>;
}

/// Which block an event was seen in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Height(u64),
    Unknown,
}

impl From<Option<u64>> for BlockRef {
    fn from(value: Option<u64>) -> Self {
        value.map(BlockRef::Height).unwrap_or(BlockRef::Unknown)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_tx_hash: Option<String>,
}

impl BlockMetadata {
    /// Flatten into the free-form per-chain metadata map.
    pub fn into_details(self) -> std::collections::BTreeMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => Default::default(),
        }
    }
}

/// Resolves block metadata, memoizing timestamps per height.
pub struct BlockMetadataResolver {
    cache: Mutex<BoundedTtlCache<u64, i64>>,
}

impl BlockMetadataResolver {
    pub fn new(cache: BoundedTtlCache<u64, i64>) -> Self {
        Self {
            cache: Mutex::new(cache),
        }
    }

    pub async fn resolve<S>(
        &self,
        source: &S,
        block: BlockRef,
        tx_hash: Option<String>,
        cancel: &CancellationToken,
    ) -> BlockMetadata
    where
        S: BlockSource + ?Sized,
    {
        let mut meta = BlockMetadata {
            event_tx_hash: tx_hash,
            ..Default::default()
        };

        let BlockRef::Height(height) = block else {
            return meta;
        };
        meta.block_height = Some(height);

        if let Some(ts) = self.cache.lock().await.get(&height) {
            meta.block_timestamp = Some(ts);
            return meta;
        }

        if cancel.is_cancelled() {
            return meta;
        }

        match source.block_timestamp(height).await {
            Ok(Some(ts)) => {
                self.cache.lock().await.insert(height, ts);
                meta.block_timestamp = Some(ts);
            }
            Ok(None) => {
                warn!(height, "Block not found while resolving timestamp");
            }
            Err(e) => {
                warn!(height, error = %e, "Failed to resolve block timestamp");
            }
        }

        meta
    }
}
