//! JSON-RPC ledger client against a stub node.

use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use compliance_engine::ledger::abi;
use compliance_engine::{LedgerClient, LedgerConfig, LedgerError, RpcLedgerClient, TxHash, WalletAddress, Wei};

const CONTRACT: &str = "0x00000000000000000000000000000000000000aa";
const DONOR: &str = "0x3333333333333333333333333333333333333333";
const TENTH: u128 = 100_000_000_000_000_000;

fn word(v: u128) -> String {
    format!("{:064x}", v)
}

fn tx_hash() -> String {
    format!("0x{}", "ab".repeat(32))
}

fn result(value: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": value }))
}

fn rpc_error(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": { "code": code, "message": message }
    }))
}

async fn respond(server: &MockServer, rpc_method: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": rpc_method })))
        .respond_with(response)
        .mount(server)
        .await;
}

fn config(server: &MockServer) -> LedgerConfig {
    LedgerConfig {
        rpc_url: server.uri(),
        contract_address: Some(WalletAddress::parse(CONTRACT).unwrap()),
        chain_id: Some(31337),
        ..Default::default()
    }
}

async fn connected(server: &MockServer) -> RpcLedgerClient {
    respond(server, "eth_chainId", result(json!("0x7a69"))).await;
    respond(server, "eth_getCode", result(json!("0x6080604052"))).await;
    let client = RpcLedgerClient::new(&config(server)).unwrap();
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_connect_checks_chain_and_code() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connect_rejects_wrong_chain() {
    let server = MockServer::start().await;
    respond(&server, "eth_chainId", result(json!("0x1"))).await;
    let client = RpcLedgerClient::new(&config(&server)).unwrap();

    assert!(matches!(client.connect().await, Err(LedgerError::InvalidResponse(_))));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_connect_rejects_missing_contract() {
    let server = MockServer::start().await;
    respond(&server, "eth_chainId", result(json!("0x7a69"))).await;
    respond(&server, "eth_getCode", result(json!("0x"))).await;
    let client = RpcLedgerClient::new(&config(&server)).unwrap();

    assert!(client.connect().await.is_err());
    assert_eq!(client.block_number().await, Err(LedgerError::NotInitialized));
}

#[tokio::test]
async fn test_contributor_info_decoded() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    let data = format!("0x{}{}{}{}", word(TENTH), word(10 * TENTH), word(1), word(1));
    respond(&server, "eth_call", result(json!(data))).await;

    let info = client
        .contributor_info(&WalletAddress::parse(DONOR).unwrap())
        .await
        .unwrap();
    assert_eq!(info.cumulative_amount, Wei::new(TENTH));
    assert_eq!(info.remaining_capacity, Wei::new(10 * TENTH));
    assert!(info.is_kyc_verified);
    assert!(info.has_contributed_before);
}

#[tokio::test]
async fn test_can_contribute_reason_decoded() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    let reason = hex::encode("KYC_REQUIRED");
    let data = format!("0x{}{}{}{:0<64}", word(0), word(0x40), word(12), reason);
    respond(&server, "eth_call", result(json!(data))).await;

    let eligibility = client
        .can_contribute(&WalletAddress::parse(DONOR).unwrap(), Wei::new(TENTH))
        .await
        .unwrap();
    assert!(!eligibility.can_contribute);
    assert_eq!(eligibility.reason, "KYC_REQUIRED");
}

#[tokio::test]
async fn test_price_from_contract() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    let data = format!("0x{}", word(3_000 * 1_000_000_000_000_000_000));
    respond(&server, "eth_call", result(json!(data))).await;

    let rate = client.native_price().await.unwrap();
    assert_eq!(rate.cents_per_native(), 300_000);
}

#[tokio::test]
async fn test_reverted_receipt() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    respond(
        &server,
        "eth_getTransactionReceipt",
        result(json!({
            "transactionHash": tx_hash(),
            "status": "0x0",
            "blockNumber": "0x10",
            "gasUsed": "0x7918",
        })),
    )
    .await;

    let receipt = client
        .transaction_receipt(&TxHash::parse(&tx_hash()).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(!receipt.success);
    assert_eq!(receipt.block_number, 16);
    assert_eq!(receipt.gas_used, 31_000);
}

#[tokio::test]
async fn test_missing_receipt_is_none() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    respond(&server, "eth_getTransactionReceipt", result(Value::Null)).await;

    let receipt = client
        .transaction_receipt(&TxHash::parse(&tx_hash()).unwrap())
        .await
        .unwrap();
    assert!(receipt.is_none());
}

#[tokio::test]
async fn test_logs_skip_removed_entries() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    let donor = WalletAddress::parse(DONOR).unwrap();
    let data = format!("0x{}{}{}{}", word(TENTH), word(2 * TENTH), word(1_700_000_000), word(0));
    let log = |removed: bool, block: &str| {
        json!({
            "topics": [abi::CONTRIBUTION_ACCEPTED_TOPIC, abi::address_topic(&donor)],
            "data": data,
            "blockNumber": block,
            "blockHash": format!("0x{}", "CD".repeat(32)),
            "transactionHash": tx_hash(),
            "logIndex": "0x0",
            "removed": removed,
        })
    };
    respond(&server, "eth_getLogs", result(json!([log(true, "0x4"), log(false, "0x5")]))).await;

    let events = client.query_events(0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.contributor, donor);
    assert_eq!(event.amount, Wei::new(TENTH));
    assert_eq!(event.cumulative_amount, Wei::new(2 * TENTH));
    assert_eq!(event.block_number, 5);
    assert_eq!(event.block_hash, format!("0x{}", "cd".repeat(32)));
}

#[tokio::test]
async fn test_overloaded_node_is_transport_error() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    respond(&server, "eth_blockNumber", ResponseTemplate::new(503)).await;

    let err = client.block_number().await.unwrap_err();
    assert!(matches!(err, LedgerError::Transport(_)));
}

#[tokio::test]
async fn test_send_refusal_is_rejected() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    respond(
        &server,
        "eth_sendTransaction",
        rpc_error(-32000, "execution reverted: Contribution limit exceeded"),
    )
    .await;

    let err = client
        .send_contribution(&WalletAddress::parse(DONOR).unwrap(), Wei::new(TENTH))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::Rejected("execution reverted: Contribution limit exceeded".to_string())
    );
}

#[tokio::test]
async fn test_send_already_known_is_unknown_outcome() {
    let server = MockServer::start().await;
    let client = connected(&server).await;
    respond(&server, "eth_sendTransaction", rpc_error(-32000, "already known")).await;

    let err = client
        .send_contribution(&WalletAddress::parse(DONOR).unwrap(), Wei::new(TENTH))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Transport(_)));
}
