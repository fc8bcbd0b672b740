// Legacy (EIP-155) transaction encoding.

use rlp::RlpStream;

use super::{keccak256, Address, Signer, H256, U256};
use crate::error::Result;

/// Unsigned pre-EIP-1559 transaction. `to == None` creates a contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: U256,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
}

/// RLP bytes ready for `eth_sendRawTransaction`, plus their hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
    pub hash: H256,
}

impl LegacyTransaction {
    fn append_fields(&self, s: &mut RlpStream) {
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas);
        match &self.to {
            Some(to) => s.append(to),
            None => s.append_empty_data(),
        };
        s.append(&self.value);
        s.append(&self.data);
    }

    /// keccak256(rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0]))
    pub fn signing_hash(&self, chain_id: u64) -> [u8; 32] {
        let mut s = RlpStream::new_list(9);
        self.append_fields(&mut s);
        s.append(&chain_id);
        s.append(&0u8);
        s.append(&0u8);
        keccak256(&s.out())
    }

    pub fn sign(&self, signer: &Signer, chain_id: u64) -> Result<SignedTransaction> {
        let sig = signer.sign_hash(&self.signing_hash(chain_id))?;
        let v = u64::from(sig.recovery_id) + 35 + chain_id * 2;

        let mut s = RlpStream::new_list(9);
        self.append_fields(&mut s);
        s.append(&v);
        s.append(&U256::from_big_endian(&sig.r));
        s.append(&U256::from_big_endian(&sig.s));
        let raw = s.out().to_vec();
        let hash = H256::from(keccak256(&raw));
        Ok(SignedTransaction { raw, hash })
    }
}

/// Address of a contract created by `sender` at `nonce`.
pub fn contract_address(sender: &Address, nonce: u64) -> Address {
    let mut s = RlpStream::new_list(2);
    s.append(sender);
    s.append(&nonce);
    Address::from_slice(&keccak256(&s.out())[12..])
}
