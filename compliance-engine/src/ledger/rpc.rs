//! Ethereum JSON-RPC ledger client.
//!
//! Works with any node exposing the standard `eth_*` methods with an unlocked
//! donor account (dev chains, custodial signers).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::abi::{self, Token};
use super::*;
use crate::config::LedgerConfig;

/// JSON-RPC error codes that indicate an overloaded or flaky node.
const TRANSIENT_RPC_CODES: [i64; 3] = [-32603, -32005, -32000];

/// Send errors after which the transaction may still be in the pool or mined.
const AMBIGUOUS_SEND_ERRORS: [&str; 8] = [
    "nonce too low",
    "already known",
    "known transaction",
    "replacement transaction underpriced",
    "timeout",
    "timed out",
    "txpool is full",
    "transaction pool is full",
];

/// Send errors that prove the transaction was never accepted.
const DEFINITE_SEND_ERRORS: [&str; 7] = [
    "revert",
    "insufficient funds",
    "gas required exceeds",
    "intrinsic gas too low",
    "exceeds block gas limit",
    "unknown account",
    "authentication needed",
];

/// JSON-RPC client bound to one campaign contract.
pub struct RpcLedgerClient {
    client: Client,
    url: String,
    contract: WalletAddress,
    chain_id: Option<u64>,
    initialized: AtomicBool,
    next_id: AtomicU64,
}

impl RpcLedgerClient {
    /// Create a client. It must be [`connect`](Self::connect)ed before use.
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let contract = config
            .contract_address
            .clone()
            .ok_or_else(|| LedgerError::InvalidInput("ledger.contract_address is not set".to_string()))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LedgerError::Transport(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.rpc_url.clone(),
            contract,
            chain_id: config.chain_id,
            initialized: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    /// Verify the endpoint serves the expected chain and that contract code
    /// exists at the configured address.
    pub async fn connect(&self) -> Result<(), LedgerError> {
        if let Some(expected) = self.chain_id {
            let value = self.rpc("eth_chainId", json!([])).await?;
            let actual = abi::parse_quantity_u64(as_str(&value)?)?;
            if actual != expected {
                return Err(LedgerError::InvalidResponse(format!(
                    "endpoint serves chain {}, expected {}",
                    actual, expected
                )));
            }
        }

        let code = self
            .rpc("eth_getCode", json!([self.contract.as_str(), "latest"]))
            .await?;
        let code = as_str(&code)?;
        if code == "0x" || code.is_empty() {
            return Err(LedgerError::InvalidResponse(format!(
                "no contract code at {}",
                self.contract
            )));
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(url = %self.url, contract = %self.contract, "Ledger client connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<(), LedgerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LedgerError::NotInitialized)
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LedgerError::Timeout(format!("{}: {}", method, e))
                } else {
                    LedgerError::Transport(format!("{}: {}", method, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("{}: HTTP {}: {}", method, status, body);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                LedgerError::Transport(msg)
            } else {
                LedgerError::InvalidResponse(msg)
            });
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(err) = body.error {
            debug!(method, code = err.code, message = %err.message, "JSON-RPC error");
            if method == "eth_sendTransaction" {
                return Err(classify_send_error(err.code, err.message));
            }
            return Err(if TRANSIENT_RPC_CODES.contains(&err.code) {
                LedgerError::Transport(format!("{}: {}", method, err.message))
            } else {
                LedgerError::InvalidResponse(format!("{}: {} ({})", method, err.message, err.code))
            });
        }

        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn call(&self, data: String) -> Result<String, LedgerError> {
        self.ensure_initialized()?;
        let value = self
            .rpc(
                "eth_call",
                json!([{ "to": self.contract.as_str(), "data": data }, "latest"]),
            )
            .await?;
        Ok(as_str(&value)?.to_string())
    }
}

/// Only a refusal that proves nothing was broadcast is `Rejected`. Anything
/// else leaves the outcome unknown.
fn classify_send_error(code: i64, message: String) -> LedgerError {
    let lower = message.to_ascii_lowercase();
    if AMBIGUOUS_SEND_ERRORS.iter().any(|m| lower.contains(m)) {
        return LedgerError::Transport(format!("eth_sendTransaction: {}", message));
    }
    if DEFINITE_SEND_ERRORS.iter().any(|m| lower.contains(m)) {
        return LedgerError::Rejected(message);
    }
    if TRANSIENT_RPC_CODES.contains(&code) {
        LedgerError::Transport(format!("eth_sendTransaction: {}", message))
    } else {
        // Malformed request, never broadcast
        LedgerError::Rejected(message)
    }
}

fn as_str(value: &Value) -> Result<&str, LedgerError> {
    value
        .as_str()
        .ok_or_else(|| LedgerError::InvalidResponse(format!("expected string, got {}", value)))
}

/// JSON-RPC request envelope.
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    status: Option<String>,
    block_number: Option<String>,
    gas_used: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    block_hash: Option<String>,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    hash: Option<String>,
}

impl RpcLog {
    /// `None` for logs that are still pending or were removed by a reorg.
    fn into_event(self) -> Result<Option<ContributionEvent>, LedgerError> {
        if self.removed {
            return Ok(None);
        }
        let (Some(block_number), Some(block_hash), Some(tx_hash), Some(log_index)) = (
            self.block_number,
            self.block_hash,
            self.transaction_hash,
            self.log_index,
        ) else {
            return Ok(None);
        };

        let topic = self
            .topics
            .get(1)
            .ok_or_else(|| LedgerError::InvalidResponse("log missing contributor topic".to_string()))?;
        let topic_words = abi::decode_words(topic)?;
        let contributor = abi::word_to_address(
            topic_words
                .first()
                .ok_or_else(|| LedgerError::InvalidResponse("empty contributor topic".to_string()))?,
        )?;

        let words = abi::decode_words(&self.data)?;
        if words.len() < 4 {
            return Err(LedgerError::InvalidResponse(format!(
                "ContributionAccepted data has {} words, expected 4",
                words.len()
            )));
        }

        Ok(Some(ContributionEvent {
            contributor,
            amount: Wei::new(abi::word_to_u128(&words[0])?),
            cumulative_amount: Wei::new(abi::word_to_u128(&words[1])?),
            timestamp: abi::word_to_u64(&words[2])?,
            tx_hash: TxHash::parse(&tx_hash)
                .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?,
            block_number: abi::parse_quantity_u64(&block_number)?,
            block_hash: block_hash.to_ascii_lowercase(),
            log_index: abi::parse_quantity_u64(&log_index)?,
        }))
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn contributor_info(&self, donor: &WalletAddress) -> Result<ContributorInfo, LedgerError> {
        let data = self
            .call(abi::encode_call(abi::GET_CONTRIBUTOR_INFO, &[Token::Address(donor)]))
            .await?;
        let (cumulative, remaining, kyc, before) = abi::decode_contributor_info(&data)?;
        Ok(ContributorInfo {
            cumulative_amount: Wei::new(cumulative),
            remaining_capacity: Wei::new(remaining),
            is_kyc_verified: kyc,
            has_contributed_before: before,
        })
    }

    async fn can_contribute(
        &self,
        donor: &WalletAddress,
        amount: Wei,
    ) -> Result<Eligibility, LedgerError> {
        let data = self
            .call(abi::encode_call(
                abi::CAN_CONTRIBUTE,
                &[Token::Address(donor), Token::Uint(amount.as_u128())],
            ))
            .await?;
        let (can_contribute, reason) = abi::decode_bool_string(&data)?;
        Ok(Eligibility {
            can_contribute,
            reason,
        })
    }

    async fn send_contribution(
        &self,
        from: &WalletAddress,
        amount: Wei,
    ) -> Result<TxHash, LedgerError> {
        self.ensure_initialized()?;
        let value = self
            .rpc(
                "eth_sendTransaction",
                json!([{
                    "from": from.as_str(),
                    "to": self.contract.as_str(),
                    "value": abi::format_quantity(amount.as_u128()),
                    "data": abi::encode_call(abi::CONTRIBUTE, &[]),
                }]),
            )
            .await?;
        TxHash::parse(as_str(&value)?).map_err(|e| LedgerError::InvalidResponse(e.to_string()))
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &TxHash,
    ) -> Result<Option<TransactionReceipt>, LedgerError> {
        self.ensure_initialized()?;
        let value = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash.as_str()]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let receipt: RpcReceipt = serde_json::from_value(value)
            .map_err(|e| LedgerError::InvalidResponse(format!("receipt: {}", e)))?;
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        Ok(Some(TransactionReceipt {
            tx_hash: TxHash::parse(&receipt.transaction_hash)
                .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?,
            success: receipt.status.as_deref() == Some("0x1"),
            block_number: abi::parse_quantity_u64(&block_number)?,
            gas_used: abi::parse_quantity_u64(&receipt.gas_used)?,
        }))
    }

    async fn query_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ContributionEvent>, LedgerError> {
        self.ensure_initialized()?;
        let value = self
            .rpc(
                "eth_getLogs",
                json!([{
                    "address": self.contract.as_str(),
                    "fromBlock": abi::format_quantity(from_block as u128),
                    "toBlock": abi::format_quantity(to_block as u128),
                    "topics": [abi::CONTRIBUTION_ACCEPTED_TOPIC],
                }]),
            )
            .await?;
        let logs: Vec<RpcLog> = serde_json::from_value(value)
            .map_err(|e| LedgerError::InvalidResponse(format!("logs: {}", e)))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if let Some(event) = log.into_event()? {
                events.push(event);
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.ensure_initialized()?;
        let value = self.rpc("eth_blockNumber", json!([])).await?;
        abi::parse_quantity_u64(as_str(&value)?)
    }

    async fn block_hash(&self, number: u64) -> Result<Option<String>, LedgerError> {
        self.ensure_initialized()?;
        let value = self
            .rpc(
                "eth_getBlockByNumber",
                json!([abi::format_quantity(number as u128), false]),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let block: RpcBlock = serde_json::from_value(value)
            .map_err(|e| LedgerError::InvalidResponse(format!("block: {}", e)))?;
        Ok(block.hash.map(|h| h.to_ascii_lowercase()))
    }

    async fn native_price(&self) -> Result<NativeRate, LedgerError> {
        let data = self.call(abi::encode_call(abi::ETH_PRICE_USD, &[])).await?;
        let words = abi::decode_words(&data)?;
        let price = words
            .first()
            .ok_or_else(|| LedgerError::InvalidResponse("empty price".to_string()))
            .and_then(abi::word_to_u128)?;
        NativeRate::from_usd_e18(price)
            .ok_or_else(|| LedgerError::InvalidResponse("contract reports a zero price".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_errors_classified() {
        let rejected = |code: i64, msg: &str| {
            matches!(classify_send_error(code, msg.to_string()), LedgerError::Rejected(_))
        };
        assert!(rejected(-32000, "execution reverted: KYC_REQUIRED"));
        assert!(rejected(-32000, "insufficient funds for gas * price + value"));
        assert!(rejected(-32602, "invalid argument 0: hex string has odd length"));

        assert!(!rejected(-32000, "nonce too low"));
        assert!(!rejected(-32000, "already known"));
        assert!(!rejected(-32000, "Replacement transaction underpriced"));
        assert!(!rejected(-32603, "request timed out"));
        assert!(!rejected(-32000, "something unexpected"));
        assert!(classify_send_error(-32000, "already known".to_string()).is_retryable());
    }

    #[test]
    fn test_requires_contract_address() {
        let config = LedgerConfig::default();
        assert!(matches!(
            RpcLedgerClient::new(&config),
            Err(LedgerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_fail_before_connect() {
        let config = LedgerConfig {
            contract_address: Some(
                WalletAddress::parse("0x00000000000000000000000000000000000000aa").unwrap(),
            ),
            ..Default::default()
        };
        let client = RpcLedgerClient::new(&config).unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.block_number().await, Err(LedgerError::NotInitialized));
    }

    #[test]
    fn test_removed_log_is_skipped() {
        let log = RpcLog {
            topics: vec![],
            data: "0x".to_string(),
            block_number: Some("0x1".to_string()),
            block_hash: Some("0xab".to_string()),
            transaction_hash: Some(format!("0x{}", "1".repeat(64))),
            log_index: Some("0x0".to_string()),
            removed: true,
        };
        assert_eq!(log.into_event().unwrap(), None);
    }
}
