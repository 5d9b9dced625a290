//! JSON-RPC broadcaster with endpoint failover

use super::SecureWallet;
use crate::tx::{Broadcaster, Transaction};
use crate::{Error, Result};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{keccak256, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Node replies meaning the transaction is already in its pool or chain.
const ALREADY_KNOWN: &[&str] = &[
    "already known",
    "known transaction",
    "already imported",
    "alreadyknown",
];

/// Signs once with the [`SecureWallet`] and submits the same raw bytes
/// through the first endpoint that accepts them.
///
/// A node's JSON-RPC error response (revert, "nonce too low", underpriced)
/// is final, except "already known" which means the node has this exact
/// transaction. A refused connection moves on to the next endpoint. Any other
/// transport failure may have reached the node, so the next endpoint is first
/// asked whether it already has the hash.
pub struct RpcBroadcaster {
    endpoints: Vec<url::Url>,
    wallet: Arc<SecureWallet>,
}

/// EIP-2718 encoded transaction and its hash
#[derive(Debug, Clone)]
struct Signed {
    raw: Bytes,
    hash: B256,
}

impl Signed {
    fn new(envelope: &impl Encodable2718) -> Self {
        let raw = envelope.encoded_2718();
        Self {
            hash: keccak256(&raw),
            raw: raw.into(),
        }
    }
}

fn is_already_known(message: &str) -> bool {
    let message = message.to_lowercase();
    ALREADY_KNOWN.iter().any(|m| message.contains(m))
}

/// True when the request never left this host.
fn is_connect_error(e: &RpcError<TransportErrorKind>) -> bool {
    match e {
        RpcError::Transport(TransportErrorKind::Custom(err)) => err
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|e| e.is_connect()),
        _ => false,
    }
}

async fn has_transaction(provider: &impl Provider, hash: B256) -> bool {
    provider
        .raw_request::<_, Option<Value>>("eth_getTransactionByHash".into(), (hash,))
        .await
        .is_ok_and(|tx| tx.is_some())
}

impl RpcBroadcaster {
    pub fn new(endpoints: &[String], wallet: Arc<SecureWallet>) -> Result<Self> {
        let endpoints = endpoints
            .iter()
            .map(|u| {
                u.parse()
                    .map_err(|e| Error::Config(format!("invalid RPC URL: {}", e)))
            })
            .collect::<Result<Vec<url::Url>>>()?;
        if endpoints.is_empty() {
            return Err(Error::Config("no RPC endpoints configured".into()));
        }
        Ok(Self { endpoints, wallet })
    }

    fn request(&self, tx: &Transaction, nonce: u64) -> TransactionRequest {
        let mut request = TransactionRequest::default()
            .from(self.wallet.address())
            .to(tx.request.to)
            .input(tx.request.data.clone().into())
            .value(tx.request.value)
            .nonce(nonce);
        request.chain_id = Some(tx.request.chain_id);
        request.gas = tx.request.gas_limit;
        request
    }

    /// Fill fees and gas from the first reachable endpoint and sign. Returns
    /// the index of that endpoint. Nothing is sent here.
    async fn sign(&self, tx: &Transaction, nonce: u64) -> Result<(usize, Signed)> {
        let mut last_error = None;
        for (idx, url) in self.endpoints.iter().enumerate() {
            let provider = ProviderBuilder::new()
                .wallet(self.wallet.wallet().clone())
                .connect_http(url.clone());

            match provider.fill(self.request(tx, nonce)).await {
                Ok(filled) => {
                    let envelope = filled.as_envelope().ok_or_else(|| {
                        Error::Broadcast("wallet filler did not sign the transaction".into())
                    })?;
                    return Ok((idx, Signed::new(envelope)));
                }
                Err(RpcError::ErrorResp(payload)) => {
                    return Err(Error::Broadcast(format!(
                        "{} (code {})",
                        payload.message, payload.code
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = idx,
                        tx_id = %tx.id,
                        nonce,
                        error = %e,
                        "RPC endpoint failed while preparing, trying next"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(Error::Broadcast(format!(
            "all {} RPC endpoints failed: {}",
            self.endpoints.len(),
            last_error.unwrap_or_default()
        )))
    }

    async fn submit(&self, signed: &Signed, tx_id: &str, first: usize) -> Result<String> {
        let hash = format!("{:#x}", signed.hash);
        let mut maybe_delivered = false;
        let mut last_error = None;

        for (idx, url) in self.endpoints.iter().enumerate().skip(first) {
            let provider = ProviderBuilder::new().connect_http(url.clone());

            if maybe_delivered && has_transaction(&provider, signed.hash).await {
                tracing::info!(endpoint = idx, tx_id, %hash, "Transaction already delivered");
                return Ok(hash);
            }
            match provider.send_raw_transaction(&signed.raw).await {
                Ok(_) => return Ok(hash),
                Err(RpcError::ErrorResp(payload)) if is_already_known(&payload.message) => {
                    tracing::info!(endpoint = idx, tx_id, %hash, "Node already has the transaction");
                    return Ok(hash);
                }
                Err(RpcError::ErrorResp(payload)) => {
                    return Err(Error::Broadcast(format!(
                        "{} (code {})",
                        payload.message, payload.code
                    )));
                }
                Err(e) => {
                    maybe_delivered |= !is_connect_error(&e);
                    tracing::warn!(
                        endpoint = idx,
                        tx_id,
                        %hash,
                        maybe_delivered,
                        error = %e,
                        "RPC endpoint failed, trying next"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(Error::Broadcast(format!(
            "all {} RPC endpoints failed: {}",
            self.endpoints.len() - first,
            last_error.unwrap_or_default()
        )))
    }
}

#[async_trait]
impl Broadcaster for RpcBroadcaster {
    async fn broadcast(&self, tx: &Transaction, nonce: u64) -> Result<String> {
        let (first, signed) = self.sign(tx, nonce).await?;
        self.submit(&signed, &tx.id, first).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::PreparedTransaction;
    use alloy::network::TransactionBuilder;
    use alloy::primitives::{hex, Address, U256};
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::{routing::post, Json, Router};
    use secrecy::SecretString;
    use serde_json::json;
    use std::sync::Mutex;

    fn wallet() -> Arc<SecureWallet> {
        Arc::new(
            SecureWallet::from_secret(&SecretString::from(
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string(),
            ))
            .unwrap(),
        )
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Accept,
        AlreadyKnown,
        Reject,
        BadGateway,
        /// Has the transaction from an earlier attempt.
        Holds,
    }

    #[derive(Clone)]
    struct Node {
        reply: Reply,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Node {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn rpc_result(id: &Value, result: Value) -> Response {
        Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
    }

    fn rpc_error(id: &Value, message: &str) -> Response {
        Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32000, "message": message}}))
            .into_response()
    }

    async fn handle(State(node): State<Node>, Json(req): Json<Value>) -> Response {
        let method = req["method"].as_str().unwrap_or_default().to_string();
        node.calls.lock().unwrap().push(method.clone());
        let id = &req["id"];
        match (node.reply, method.as_str()) {
            (Reply::BadGateway, _) => StatusCode::BAD_GATEWAY.into_response(),
            (Reply::Holds, "eth_getTransactionByHash") => {
                rpc_result(id, json!({"hash": req["params"][0]}))
            }
            (_, "eth_getTransactionByHash") => rpc_result(id, Value::Null),
            (Reply::Accept, "eth_sendRawTransaction") => {
                let raw = hex::decode(req["params"][0].as_str().unwrap_or_default()).unwrap();
                rpc_result(id, json!(format!("{:#x}", keccak256(raw))))
            }
            (Reply::AlreadyKnown, _) => rpc_error(id, "already known"),
            (Reply::Reject, _) => rpc_error(id, "insufficient funds for gas * price + value"),
            (_, other) => rpc_error(id, &format!("unexpected method {}", other)),
        }
    }

    async fn node(reply: Reply) -> (Node, String) {
        let node = Node {
            reply,
            calls: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new().route("/", post(handle)).with_state(node.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (node, format!("http://{}/", addr))
    }

    /// An address with nothing listening on it.
    async fn dead_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}/", listener.local_addr().unwrap())
    }

    async fn signed(nonce: u64) -> Signed {
        let envelope = TransactionRequest::default()
            .with_to(Address::repeat_byte(0x11))
            .with_value(U256::from(5u64))
            .with_nonce(nonce)
            .with_chain_id(1)
            .with_gas_limit(21_000)
            .with_max_fee_per_gas(30_000_000_000)
            .with_max_priority_fee_per_gas(1_000_000_000)
            .build(wallet().wallet())
            .await
            .unwrap();
        Signed::new(&envelope)
    }

    fn broadcaster(urls: &[String]) -> RpcBroadcaster {
        RpcBroadcaster::new(urls, wallet()).unwrap()
    }

    #[test]
    fn requires_valid_endpoints() {
        assert!(matches!(
            RpcBroadcaster::new(&[], wallet()),
            Err(Error::Config(_))
        ));
        assert!(RpcBroadcaster::new(&["not a url".into()], wallet()).is_err());
        assert!(RpcBroadcaster::new(&["http://127.0.0.1:8545".into()], wallet()).is_ok());
    }

    #[test]
    fn request_pins_nonce_and_chain() {
        let b = RpcBroadcaster::new(&["http://127.0.0.1:8545".into()], wallet()).unwrap();
        let tx = Transaction {
            id: "tx-1".into(),
            venue: "uniswap".into(),
            request: PreparedTransaction {
                to: Address::repeat_byte(0x11),
                data: Bytes::from(vec![0xde, 0xad]),
                value: U256::from(5u64),
                gas_limit: Some(210_000),
                chain_id: 10,
            },
        };
        let req = b.request(&tx, 42);
        assert_eq!(req.nonce, Some(42));
        assert_eq!(req.chain_id, Some(10));
        assert_eq!(req.gas, Some(210_000));
        assert_eq!(req.from, Some(b.wallet.address()));
        assert_eq!(req.value, Some(U256::from(5u64)));
    }

    #[test]
    fn recognises_already_known_replies() {
        assert!(is_already_known("already known"));
        assert!(is_already_known("Known transaction: 0xabc"));
        assert!(is_already_known("AlreadyKnown"));
        assert!(!is_already_known("nonce too low"));
    }

    #[tokio::test]
    async fn refused_connection_fails_over() {
        let (node, url) = node(Reply::Accept).await;
        let b = broadcaster(&[dead_endpoint().await, url]);
        let tx = signed(7).await;

        let hash = b.submit(&tx, "tx-1", 0).await.unwrap();
        assert_eq!(hash, format!("{:#x}", tx.hash));
        assert!(node.calls().contains(&"eth_sendRawTransaction".to_string()));
    }

    #[tokio::test]
    async fn already_known_counts_as_sent() {
        let (first, first_url) = node(Reply::AlreadyKnown).await;
        let (second, second_url) = node(Reply::Accept).await;
        let b = broadcaster(&[first_url, second_url]);
        let tx = signed(7).await;

        assert_eq!(b.submit(&tx, "tx-1", 0).await.unwrap(), format!("{:#x}", tx.hash));
        assert_eq!(first.calls(), vec!["eth_sendRawTransaction"]);
        assert!(second.calls().is_empty());
    }

    #[tokio::test]
    async fn node_rejection_is_final() {
        let (first, first_url) = node(Reply::Reject).await;
        let (second, second_url) = node(Reply::Accept).await;
        let b = broadcaster(&[first_url, second_url]);

        let err = b.submit(&signed(7).await, "tx-1", 0).await.unwrap_err();
        assert!(matches!(err, Error::Broadcast(ref m) if m.contains("insufficient funds")));
        assert_eq!(first.calls().len(), 1);
        assert!(second.calls().is_empty());
    }

    #[tokio::test]
    async fn possibly_delivered_send_is_not_repeated() {
        let (_, flaky_url) = node(Reply::BadGateway).await;
        let (holder, holder_url) = node(Reply::Holds).await;
        let b = broadcaster(&[flaky_url, holder_url]);
        let tx = signed(7).await;

        assert_eq!(b.submit(&tx, "tx-1", 0).await.unwrap(), format!("{:#x}", tx.hash));
        assert_eq!(holder.calls(), vec!["eth_getTransactionByHash"]);
    }

    #[tokio::test]
    async fn every_endpoint_down_is_a_broadcast_error() {
        let b = broadcaster(&[dead_endpoint().await, dead_endpoint().await]);
        assert!(matches!(
            b.submit(&signed(7).await, "tx-1", 0).await,
            Err(Error::Broadcast(_))
        ));
    }
}
