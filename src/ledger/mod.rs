// Ledger client
//
// Thin access to an Ethereum-compatible node over JSON-RPC:
// - `RpcClient`: HTTP transport and the handful of `eth_*` methods we need
// - `Signer`: signing identity derived from configured key material
// - `LegacyTransaction`: EIP-155 encoding and signing of outgoing transactions
//
// Consensus, execution and confirmation tracking all stay on the node. The
// registry session is written against the `Ledger` trait so it can run
// against an in-memory chain in tests.

mod rpc;
mod signer;
mod transaction;

pub use ethereum_types::{H160 as Address, H256, U256};
pub use rpc::RpcClient;
pub use signer::{address_of, RecoverableSignature, Signer};
pub use transaction::{contract_address, LegacyTransaction, SignedTransaction};

use crate::error::{Error, Result};
use sha3::{Digest, Keccak256};

/// Parameters shared by `eth_call` and `eth_estimateGas`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    /// `None` for contract creation
    pub to: Option<Address>,
    pub data: Vec<u8>,
}

/// Capability set of a remote ledger node.
pub trait Ledger {
    /// Chain id used for replay-protected signatures.
    fn chain_id(&self) -> u64;

    /// Next nonce for `address`, counting pending transactions.
    fn pending_nonce(&self, address: Address) -> Result<u64>;

    /// Gas price suggested by the node.
    fn gas_price(&self) -> Result<U256>;

    fn estimate_gas(&self, request: &CallRequest) -> Result<U256>;

    /// Read-only call against the latest state.
    fn call(&self, request: &CallRequest) -> Result<Vec<u8>>;

    /// Submit a signed transaction. Returns once the node has accepted it,
    /// not once it is mined.
    fn send_raw_transaction(&self, raw: &[u8]) -> Result<H256>;

    /// Release the connection.
    fn close(self)
    where
        Self: Sized,
    {
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Parse a 20-byte hex address, with or without `0x`.
pub fn parse_address(s: &str) -> Result<Address> {
    let bytes = hex::decode(strip_0x(s.trim()))?;
    if bytes.len() != 20 {
        return Err(Error::InvalidResponse(format!(
            "address must be 20 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

/// `0x`-prefixed lowercase hex of an address.
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

pub fn format_hash(hash: &H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

pub(crate) fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}
