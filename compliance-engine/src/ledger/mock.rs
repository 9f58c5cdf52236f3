//! Mock ledger for testing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::*;
use crate::money::WEI_PER_NATIVE;

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const BLOCK_TIME_SECS: u64 = 12;

struct MockState {
    head: u64,
    fork: u64,
    block_hashes: BTreeMap<u64, String>,
    events: Vec<ContributionEvent>,
    receipts: HashMap<TxHash, TransactionReceipt>,
    kyc: HashSet<WalletAddress>,
    price: NativeRate,
    limit: Wei,
    next_tx: u64,
    revert_next_send: bool,
    reject_next_send: Option<String>,
    lose_next_send_response: bool,
    withhold_receipts: bool,
}

impl MockState {
    fn block_hash_for(&self, number: u64) -> String {
        format!("0x{:016x}{:016x}{:032x}", self.fork, number, 0xb10c_u128)
    }

    fn mine_block(&mut self) -> u64 {
        self.head += 1;
        let hash = self.block_hash_for(self.head);
        self.block_hashes.insert(self.head, hash);
        self.head
    }

    fn next_tx_hash(&mut self) -> TxHash {
        self.next_tx += 1;
        let raw = format!("0x{:048x}{:016x}", 0xc0ffee_u128, self.next_tx);
        TxHash::parse(&raw).unwrap_or_else(|_| unreachable!("mock hash is well formed"))
    }

    fn cumulative(&self, wallet: &WalletAddress) -> Wei {
        self.events
            .iter()
            .filter(|e| &e.contributor == wallet)
            .map(|e| e.amount)
            .sum()
    }

    /// Mine a block containing one accepted contribution.
    fn mine_contribution(&mut self, from: &WalletAddress, amount: Wei, success: bool) -> TxHash {
        let tx_hash = self.next_tx_hash();
        let block = self.mine_block();
        if success {
            let cumulative = self.cumulative(from) + amount;
            let block_hash = self.block_hash_for(block);
            self.events.push(ContributionEvent {
                contributor: from.clone(),
                amount,
                cumulative_amount: cumulative,
                timestamp: GENESIS_TIMESTAMP + block * BLOCK_TIME_SECS,
                tx_hash: tx_hash.clone(),
                block_number: block,
                block_hash,
                log_index: 0,
            });
        }
        self.receipts.insert(
            tx_hash.clone(),
            TransactionReceipt {
                tx_hash: tx_hash.clone(),
                success,
                block_number: block,
                gas_used: if success { 62_000 } else { 31_000 },
            },
        );
        tx_hash
    }
}

/// In-memory ledger.
///
/// Every submitted contribution is mined into its own block immediately.
/// Reachability, receipt delivery and reorgs are scriptable.
pub struct MockLedger {
    state: Mutex<MockState>,
    reachable: AtomicBool,
    receipt_calls: AtomicU32,
    send_calls: AtomicU32,
}

impl MockLedger {
    /// Create a ledger at block 0 with a $3,000 price and a 1.1 native unit limit.
    pub fn new() -> Self {
        let price = NativeRate::from_cents_per_native(300_000)
            .unwrap_or_else(|| unreachable!("non-zero rate"));
        Self {
            state: Mutex::new(MockState {
                head: 0,
                fork: 0,
                block_hashes: BTreeMap::new(),
                events: Vec::new(),
                receipts: HashMap::new(),
                kyc: HashSet::new(),
                price,
                limit: Wei::new(WEI_PER_NATIVE + WEI_PER_NATIVE / 10),
                next_tx: 0,
                revert_next_send: false,
                reject_next_send: None,
                lose_next_send_response: false,
                withhold_receipts: false,
            }),
            reachable: AtomicBool::new(true),
            receipt_calls: AtomicU32::new(0),
            send_calls: AtomicU32::new(0),
        }
    }

    /// Mark a wallet as KYC-verified.
    pub fn with_kyc(self, wallet: &WalletAddress) -> Self {
        self.set_kyc(wallet, true);
        self
    }

    /// Set the contract price.
    pub fn with_price(self, price: NativeRate) -> Self {
        self.lock().price = price;
        self
    }

    /// Set availability.
    pub fn with_reachable(self, reachable: bool) -> Self {
        self.set_reachable(reachable);
        self
    }

    /// The next submitted transaction is mined but reverts.
    pub fn with_revert_next_send(self) -> Self {
        self.lock().revert_next_send = true;
        self
    }

    /// The next submission is refused by the node before mining.
    pub fn with_reject_next_send(self, reason: impl Into<String>) -> Self {
        self.lock().reject_next_send = Some(reason.into());
        self
    }

    /// The next submission is mined, but the client sees a transport error.
    pub fn with_lost_send_response(self) -> Self {
        self.lock().lose_next_send_response = true;
        self
    }

    /// Receipts are never returned, so confirmations time out.
    pub fn with_withheld_receipts(self) -> Self {
        self.set_withhold_receipts(true);
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_kyc(&self, wallet: &WalletAddress, verified: bool) {
        let mut state = self.lock();
        if verified {
            state.kyc.insert(wallet.clone());
        } else {
            state.kyc.remove(wallet);
        }
    }

    pub fn set_withhold_receipts(&self, withhold: bool) {
        self.lock().withhold_receipts = withhold;
    }

    /// Record a contribution made outside the engine (another wallet app).
    pub fn record_external_contribution(&self, from: &WalletAddress, amount: Wei) -> TxHash {
        self.lock().mine_contribution(from, amount, true)
    }

    /// Mine `count` empty blocks.
    pub fn advance_blocks(&self, count: u64) -> u64 {
        let mut state = self.lock();
        for _ in 0..count {
            state.mine_block();
        }
        state.head
    }

    /// Replace every block from `from_block` to head with a new fork.
    ///
    /// With `drop_events` the contributions in those blocks vanish along with
    /// their receipts; otherwise they are re-included on the new fork.
    pub fn reorg(&self, from_block: u64, drop_events: bool) {
        let mut state = self.lock();
        state.fork += 1;
        let head = state.head;
        for n in from_block..=head {
            let hash = state.block_hash_for(n);
            state.block_hashes.insert(n, hash);
        }
        if drop_events {
            let dropped: Vec<TxHash> = state
                .events
                .iter()
                .filter(|e| e.block_number >= from_block)
                .map(|e| e.tx_hash.clone())
                .collect();
            state.events.retain(|e| e.block_number < from_block);
            for hash in dropped {
                state.receipts.remove(&hash);
            }
        } else {
            let fork_hashes = state.block_hashes.clone();
            for event in state.events.iter_mut().filter(|e| e.block_number >= from_block) {
                if let Some(hash) = fork_hashes.get(&event.block_number) {
                    event.block_hash = hash.clone();
                }
            }
        }
    }

    pub fn head(&self) -> u64 {
        self.lock().head
    }

    pub fn events(&self) -> Vec<ContributionEvent> {
        self.lock().events.clone()
    }

    /// Get the number of receipt lookups.
    pub fn receipt_calls(&self) -> u32 {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    /// Get the number of submissions, including refused ones.
    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::Transport("mock ledger unreachable".to_string()))
        }
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn contributor_info(&self, donor: &WalletAddress) -> Result<ContributorInfo, LedgerError> {
        self.check_reachable()?;
        let state = self.lock();
        let cumulative = state.cumulative(donor);
        Ok(ContributorInfo {
            cumulative_amount: cumulative,
            remaining_capacity: state.limit.saturating_sub(cumulative),
            is_kyc_verified: state.kyc.contains(donor),
            has_contributed_before: cumulative > Wei::ZERO,
        })
    }

    async fn can_contribute(
        &self,
        donor: &WalletAddress,
        amount: Wei,
    ) -> Result<Eligibility, LedgerError> {
        self.check_reachable()?;
        let state = self.lock();
        let (can_contribute, reason) = if amount == Wei::ZERO {
            (false, "INVALID_AMOUNT")
        } else if !state.kyc.contains(donor) {
            (false, "KYC_REQUIRED")
        } else if state.cumulative(donor) + amount > state.limit {
            (false, "Contribution limit exceeded")
        } else {
            (true, "Eligible for contribution")
        };
        Ok(Eligibility {
            can_contribute,
            reason: reason.to_string(),
        })
    }

    async fn send_contribution(
        &self,
        from: &WalletAddress,
        amount: Wei,
    ) -> Result<TxHash, LedgerError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let mut state = self.lock();

        if let Some(reason) = state.reject_next_send.take() {
            return Err(LedgerError::Rejected(reason));
        }
        if !state.kyc.contains(from) {
            return Err(LedgerError::Rejected("execution reverted: KYC_REQUIRED".to_string()));
        }

        let success = !std::mem::take(&mut state.revert_next_send);
        let tx_hash = state.mine_contribution(from, amount, success);

        if std::mem::take(&mut state.lose_next_send_response) {
            return Err(LedgerError::Transport("connection reset by peer".to_string()));
        }
        Ok(tx_hash)
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Option<TransactionReceipt>, LedgerError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let state = self.lock();
        if state.withhold_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(tx_hash).cloned())
    }

    async fn query_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ContributionEvent>, LedgerError> {
        self.check_reachable()?;
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.check_reachable()?;
        Ok(self.lock().head)
    }

    async fn block_hash(&self, number: u64) -> Result<Option<String>, LedgerError> {
        self.check_reachable()?;
        let state = self.lock();
        if number == 0 {
            return Ok(Some(state.block_hash_for(0)));
        }
        Ok(state.block_hashes.get(&number).cloned())
    }

    async fn native_price(&self) -> Result<NativeRate, LedgerError> {
        self.check_reachable()?;
        Ok(self.lock().price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> WalletAddress {
        WalletAddress::parse("0x2222222222222222222222222222222222222222").unwrap()
    }

    #[tokio::test]
    async fn test_mock_contribution_flow() {
        let ledger = MockLedger::new().with_kyc(&wallet());

        let tx = ledger.send_contribution(&wallet(), Wei::new(500)).await.unwrap();
        let receipt = ledger.transaction_receipt(&tx).await.unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.block_number, 1);

        let info = ledger.contributor_info(&wallet()).await.unwrap();
        assert_eq!(info.cumulative_amount, Wei::new(500));
        assert!(info.is_kyc_verified);
        assert!(info.has_contributed_before);

        let events = ledger.query_events(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_hash, tx);
    }

    #[tokio::test]
    async fn test_mock_unreachable() {
        let ledger = MockLedger::new().with_reachable(false);
        let result = ledger.block_number().await;
        assert!(matches!(result, Err(LedgerError::Transport(_))));
    }

    #[tokio::test]
    async fn test_mock_reorg_changes_hashes() {
        let ledger = MockLedger::new().with_kyc(&wallet());
        ledger.send_contribution(&wallet(), Wei::new(1)).await.unwrap();
        ledger.advance_blocks(3);
        let before = ledger.block_hash(1).await.unwrap();

        ledger.reorg(1, true);

        assert_ne!(ledger.block_hash(1).await.unwrap(), before);
        assert!(ledger.query_events(0, 10).await.unwrap().is_empty());
    }
}
