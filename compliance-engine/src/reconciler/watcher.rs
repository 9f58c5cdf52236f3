//! Live chain watcher.
//!
//! Polls the ledger head, delivers new contribution events and reports
//! reorganizations by comparing recorded block hashes against the canonical
//! chain.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::ledger::{ContributionEvent, LedgerClient};

/// What the watcher delivers to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Contribution(ContributionEvent),
    /// Block `block` and everything after it changed
    Reorg { block: u64 },
}

pub struct ChainWatcher {
    ledger: Arc<dyn LedgerClient>,
    poll_interval: Duration,
    reorg_window: u64,
    next_block: u64,
    /// Block hashes observed for recent blocks
    seen: BTreeMap<u64, String>,
}

impl ChainWatcher {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        start_block: u64,
        poll_interval: Duration,
        reorg_window: u64,
    ) -> Self {
        Self {
            ledger,
            poll_interval,
            reorg_window: reorg_window.max(1),
            next_block: start_block,
            seen: BTreeMap::new(),
        }
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// One poll: reorg check, then any new events up to the head.
    pub async fn poll_once(&mut self) -> Result<Vec<WatchEvent>, EngineError> {
        let mut out = Vec::new();

        if let Some(block) = self.detect_reorg().await? {
            warn!(block, "Chain reorganization detected");
            self.seen.split_off(&block);
            self.next_block = self.next_block.min(block);
            out.push(WatchEvent::Reorg { block });
        }

        let head = self.ledger.block_number().await?;
        if head < self.next_block {
            return Ok(out);
        }

        let events = self.ledger.query_events(self.next_block, head).await?;
        if let Some(hash) = self.ledger.block_hash(head).await? {
            self.seen.insert(head, hash);
        }
        for event in &events {
            self.seen.insert(event.block_number, event.block_hash.clone());
        }
        debug!(from = self.next_block, to = head, events = events.len(), "Polled chain");

        self.next_block = head + 1;
        let floor = head.saturating_sub(self.reorg_window);
        self.seen = self.seen.split_off(&floor);

        out.extend(events.into_iter().map(WatchEvent::Contribution));
        Ok(out)
    }

    /// Lowest recorded block whose hash no longer matches, checking the
    /// newest first and walking back only on a mismatch.
    async fn detect_reorg(&self) -> Result<Option<u64>, EngineError> {
        let mut changed = None;
        for (&number, recorded) in self.seen.iter().rev() {
            let current = self.ledger.block_hash(number).await?;
            if current.as_deref() == Some(recorded.as_str()) {
                break;
            }
            changed = Some(number);
        }
        Ok(changed)
    }

    /// Poll until shutdown, forwarding events to `tx`.
    pub async fn run(mut self, tx: mpsc::Sender<WatchEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.poll_interval);
        info!(from = self.next_block, "Chain watcher started");

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.poll_once().await {
                        Ok(events) => {
                            for event in events {
                                if tx.send(event).await.is_err() {
                                    info!("Event receiver closed, stopping chain watcher");
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "Chain poll failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Chain watcher shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::WalletAddress;
    use crate::ledger::MockLedger;
    use crate::money::Wei;

    fn wallet() -> WalletAddress {
        WalletAddress::parse("0x5555555555555555555555555555555555555555").unwrap()
    }

    #[tokio::test]
    async fn test_delivers_new_events_once() {
        let ledger = Arc::new(MockLedger::new());
        let mut watcher = ChainWatcher::new(ledger.clone(), 0, Duration::from_millis(10), 16);

        ledger.record_external_contribution(&wallet(), Wei::new(1_000));
        let first = watcher.poll_once().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], WatchEvent::Contribution(_)));

        assert!(watcher.poll_once().await.unwrap().is_empty());
        assert_eq!(watcher.next_block(), ledger.head() + 1);
    }

    #[tokio::test]
    async fn test_reports_reorg_and_replays_surviving_events() {
        let ledger = Arc::new(MockLedger::new());
        let mut watcher = ChainWatcher::new(ledger.clone(), 0, Duration::from_millis(10), 16);

        ledger.record_external_contribution(&wallet(), Wei::new(1_000));
        ledger.record_external_contribution(&wallet(), Wei::new(2_000));
        ledger.advance_blocks(2);
        watcher.poll_once().await.unwrap();

        // Second contribution was mined in block 2
        ledger.reorg(2, false);
        let events = watcher.poll_once().await.unwrap();
        assert_eq!(events[0], WatchEvent::Reorg { block: 2 });
        let replayed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WatchEvent::Contribution(c) => Some(c.block_number),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec![2]);
    }
}
