//! Forward-only height scanning over a Cosmos chain.

use tracing::debug;

use crate::error::PollError;
use crate::pollers::PollContext;
use crate::rpc::{CosmosRpc, CosmosTx, HeightQuery};

/// Scans heights forward from a start height until a matcher accepts one.
pub(crate) struct HeightScanner<'a> {
    pub rpc: &'a dyn CosmosRpc,
    pub query: HeightQuery,
    /// Heights fetched before re-reading the chain head.
    pub max_heights_per_pass: u64,
}

impl<'a> HeightScanner<'a> {
    /// Starting height when the caller gave none: `latest - lookback`.
    pub async fn default_start(&self, ctx: &PollContext<'_>, lookback: u64) -> Result<u64, PollError> {
        let latest = ctx
            .call("latest_height", || self.rpc.latest_height())
            .await?;
        Ok(latest.saturating_sub(lookback).max(1))
    }

    /// Visit heights from `start` until `matcher` returns `Some`.
    ///
    /// Returns the match and the height it was found at. Each height is
    /// visited once; after catching up with the head the scanner sleeps one
    /// interval before re-reading it.
    pub async fn find<T, F>(
        &self,
        ctx: &PollContext<'_>,
        start: u64,
        mut matcher: F,
    ) -> Result<(T, u64), PollError>
    where
        F: FnMut(u64, &[CosmosTx]) -> Result<Option<T>, PollError>,
    {
        let mut next = start.max(1);

        loop {
            ctx.check()?;
            let latest = ctx
                .call("latest_height", || self.rpc.latest_height())
                .await?;
            let pass_end = latest.min(next.saturating_add(self.max_heights_per_pass.max(1) - 1));

            while next <= pass_end {
                ctx.check()?;
                let height = next;
                let txs = ctx
                    .call("events_at", || self.rpc.events_at(height, self.query))
                    .await?;
                if let Some(found) = matcher(height, &txs)? {
                    return Ok((found, height));
                }
                next += 1;
            }

            debug!(
                flow_id = ctx.flow_id,
                chain = %ctx.chain,
                next_height = next,
                latest,
                "Height scan pass complete"
            );

            if next > latest {
                ctx.pause().await?;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::block_meta::BlockSource;
    use crate::pollers::tests::params;
    use crate::retry::RetryConfig;
    use crate::rpc::{ForwardingAccount, TxEvent};
    use crate::types::{ChainKey, FlowType};
    use async_trait::async_trait;
    use eyre::{eyre, Result};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory Cosmos chain: events per height and a head that advances by
    /// `advance_per_status` on every `latest_height` call.
    pub(crate) struct FakeCosmos {
        pub heights: Mutex<HashMap<u64, Vec<CosmosTx>>>,
        pub head: Mutex<u64>,
        pub advance_per_status: u64,
        pub forwarding: Mutex<Option<ForwardingAccount>>,
        pub visited: Mutex<Vec<u64>>,
        pub fail_next_events: Mutex<u32>,
    }

    impl FakeCosmos {
        pub(crate) fn new(head: u64) -> Self {
            Self {
                heights: Mutex::new(HashMap::new()),
                head: Mutex::new(head),
                advance_per_status: 0,
                forwarding: Mutex::new(None),
                visited: Mutex::new(Vec::new()),
                fail_next_events: Mutex::new(0),
            }
        }

        pub(crate) fn put(&self, height: u64, hash: Option<&str>, code: u32, events: Vec<TxEvent>) {
            self.heights
                .lock()
                .unwrap()
                .entry(height)
                .or_default()
                .push(CosmosTx {
                    hash: hash.map(str::to_string),
                    code,
                    events,
                });
        }
    }

    #[async_trait]
    impl BlockSource for FakeCosmos {
        async fn block_timestamp(&self, height: u64) -> Result<Option<i64>> {
            Ok(Some(1_700_000_000 + height as i64))
        }
    }

    #[async_trait]
    impl CosmosRpc for FakeCosmos {
        async fn latest_height(&self) -> Result<u64> {
            let mut head = self.head.lock().unwrap();
            let current = *head;
            *head += self.advance_per_status;
            Ok(current)
        }

        async fn events_at(&self, height: u64, _query: HeightQuery) -> Result<Vec<CosmosTx>> {
            {
                let mut fail = self.fail_next_events.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(eyre!("connection reset by peer"));
                }
            }
            self.visited.lock().unwrap().push(height);
            Ok(self
                .heights
                .lock()
                .unwrap()
                .get(&height)
                .cloned()
                .unwrap_or_default())
        }

        async fn forwarding_account(&self, _channel: &str, recipient: &str) -> Result<ForwardingAccount> {
            self.forwarding
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| eyre!("no forwarding account for {}", recipient))
        }
    }

    fn marker(tx: &CosmosTx) -> bool {
        tx.events.iter().any(|e| e.kind == "marker")
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_visits_each_height_once_across_passes() {
        let chain = FakeCosmos {
            advance_per_status: 2,
            ..FakeCosmos::new(12)
        };
        chain.put(15, Some("AA"), 0, vec![TxEvent::new("marker", &[])]);
        let p = params(ChainKey::Noble, FlowType::Deposit, Default::default());
        let retry = RetryConfig::default();
        let ctx = PollContext::new(&p, &retry);
        let scanner = HeightScanner {
            rpc: &chain,
            query: HeightQuery::TxSearch,
            max_heights_per_pass: 10,
        };

        let (hash, height) = scanner
            .find(&ctx, 10, |_, txs| {
                Ok(txs.iter().find(|t| marker(t)).and_then(|t| t.hash.clone()))
            })
            .await
            .unwrap();

        assert_eq!(hash, "AA");
        assert_eq!(height, 15);
        assert_eq!(*chain.visited.lock().unwrap(), vec![10, 11, 12, 13, 14, 15]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_retries_transient_rpc_errors() {
        let chain = FakeCosmos::new(5);
        *chain.fail_next_events.lock().unwrap() = 1;
        chain.put(5, Some("BB"), 0, vec![TxEvent::new("marker", &[])]);
        let p = params(ChainKey::Namada, FlowType::Deposit, Default::default());
        let retry = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        };
        let ctx = PollContext::new(&p, &retry);
        let scanner = HeightScanner {
            rpc: &chain,
            query: HeightQuery::BlockResults,
            max_heights_per_pass: 10,
        };
        let (_, height) = scanner
            .find(&ctx, 5, |_, txs| Ok(txs.iter().find(|t| marker(t)).map(|_| ())))
            .await
            .unwrap();
        assert_eq!(height, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_times_out() {
        let chain = FakeCosmos::new(3);
        let mut p = params(ChainKey::Namada, FlowType::Deposit, Default::default());
        p.timeout = Duration::from_secs(30);
        let retry = RetryConfig::default();
        let ctx = PollContext::new(&p, &retry);
        let scanner = HeightScanner {
            rpc: &chain,
            query: HeightQuery::BlockResults,
            max_heights_per_pass: 10,
        };
        let err = scanner
            .find(&ctx, 1, |_, _| Ok(None::<()>))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::PollErrorKind::PollingTimeout);
        assert_eq!(*chain.visited.lock().unwrap(), vec![1, 2, 3]);
    }
}
