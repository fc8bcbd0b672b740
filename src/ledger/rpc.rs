// JSON-RPC transport: blocking HTTP client for an Ethereum node endpoint.

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cell::Cell;
use std::time::Duration;
use tracing::{debug, info};

use super::{format_address, strip_0x, Address, CallRequest, Ledger, H256, U256};
use crate::error::{Error, Result};

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Connection to a ledger node.
pub struct RpcClient {
    client: Client,
    url: String,
    chain_id: u64,
    next_id: Cell<u64>,
}

impl RpcClient {
    /// Build the client and probe the node with `eth_chainId`. Any failure
    /// here is a connection error: nothing downstream works without a node.
    pub fn connect(url: &str) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(Error::Connection("no ledger endpoint configured".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Connection(format!(
                "unsupported endpoint {} (only http and https are supported)",
                url
            )));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {}", e)))?;

        let mut rpc = RpcClient {
            client,
            url: url.trim().to_string(),
            chain_id: 0,
            next_id: Cell::new(1),
        };

        let chain_id: String = rpc
            .request("eth_chainId", json!([]))
            .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?;
        rpc.chain_id = parse_u64(&chain_id)
            .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?;

        info!(url = %rpc.url, chain_id = rpc.chain_id, "Connected to ledger node");
        Ok(rpc)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let body = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        debug!(method, id, "RPC request");

        let res = self.client.post(&self.url).json(&body).send()?;
        if !res.status().is_success() {
            let status = res.status();
            let txt = res.text().unwrap_or_default();
            return Err(Error::InvalidResponse(format!("{} - {}", status, txt)));
        }

        let resp: RpcResponse = res.json()?;
        if let Some(err) = resp.error {
            let message = match err.data {
                Some(Value::String(data)) => format!("{} ({})", err.message, data),
                _ => err.message,
            };
            return Err(Error::Rpc {
                code: err.code,
                message,
            });
        }
        let result = resp.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| Error::InvalidResponse(format!("{}: {}", method, e)))
    }
}

impl Ledger for RpcClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn pending_nonce(&self, address: Address) -> Result<u64> {
        let nonce: String = self.request(
            "eth_getTransactionCount",
            json!([format_address(&address), "pending"]),
        )?;
        parse_u64(&nonce)
    }

    fn gas_price(&self) -> Result<U256> {
        let price: String = self.request("eth_gasPrice", json!([]))?;
        parse_quantity(&price)
    }

    fn estimate_gas(&self, request: &CallRequest) -> Result<U256> {
        let gas: String = self.request("eth_estimateGas", json!([call_object(request)]))?;
        parse_quantity(&gas)
    }

    fn call(&self, request: &CallRequest) -> Result<Vec<u8>> {
        let data: String = self.request("eth_call", json!([call_object(request), "latest"]))?;
        Ok(hex::decode(strip_0x(&data))?)
    }

    fn send_raw_transaction(&self, raw: &[u8]) -> Result<H256> {
        let hash: String = self.request(
            "eth_sendRawTransaction",
            json!([format!("0x{}", hex::encode(raw))]),
        )?;
        let bytes = hex::decode(strip_0x(&hash))?;
        if bytes.len() != 32 {
            return Err(Error::InvalidResponse(format!("bad transaction hash {}", hash)));
        }
        Ok(H256::from_slice(&bytes))
    }

    fn close(self) {
        debug!(url = %self.url, "Closing ledger connection");
    }
}

fn call_object(request: &CallRequest) -> Value {
    let mut obj = serde_json::Map::new();
    if let Some(from) = &request.from {
        obj.insert("from".into(), Value::String(format_address(from)));
    }
    if let Some(to) = &request.to {
        obj.insert("to".into(), Value::String(format_address(to)));
    }
    obj.insert(
        "data".into(),
        Value::String(format!("0x{}", hex::encode(&request.data))),
    );
    Value::Object(obj)
}

fn parse_quantity(s: &str) -> Result<U256> {
    U256::from_str_radix(strip_0x(s), 16)
        .map_err(|_| Error::InvalidResponse(format!("bad quantity {}", s)))
}

fn parse_u64(s: &str) -> Result<u64> {
    u64::from_str_radix(strip_0x(s), 16)
        .map_err(|_| Error::InvalidResponse(format!("bad quantity {}", s)))
}
