// Registry session: binds a signing identity and a call context to one
// deployed `Identity` contract and exposes the two domain operations,
// set-record and get-record.
//
// Writes are reported as soon as the node accepts the transaction. They are
// *submitted*, not confirmed; tracking confirmation is up to the user.

use crate::error::{Error, Result};
use crate::ledger::{
    contract_address, format_address, format_hash, parse_address, strip_0x, Address,
    CallRequest, Ledger, LegacyTransaction, Signer, H256, U256,
};
use crate::storage::ContentId;
use ethabi::Token;
use std::fmt;
use tracing::{debug, info};

/// ABI of `contracts/Identity.sol`.
const IDENTITY_ABI: &str = include_str!("../contracts/Identity.abi.json");
/// Creation bytecode of the registry, assembled from `contracts/Identity.evm`.
const IDENTITY_BIN: &str = include_str!("../contracts/Identity.bin");

const SET_ACADEMIC_DETAILS: &str = "setAcademicDetails";
const GET_ACADEMIC_DETAILS: &str = "getAcademicDetails";

/// Parsed ABI of the registry contract.
pub fn identity_abi() -> Result<ethabi::Contract> {
    Ok(ethabi::Contract::load(IDENTITY_ABI.as_bytes())?)
}

/// Creation bytecode deployed when no other bytecode is configured.
pub fn identity_bytecode() -> Result<Vec<u8>> {
    parse_bytecode(IDENTITY_BIN)
}

/// On-chain academic record. Only holds the identifier of the directory of
/// documents on IPFS; empty when nothing was ever stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcademicRecord {
    pub degree_id: String,
}

impl AcademicRecord {
    pub fn new(degree_id: impl Into<String>) -> Self {
        AcademicRecord {
            degree_id: degree_id.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.degree_id.is_empty()
    }

    pub fn content_id(&self) -> ContentId {
        ContentId::new(self.degree_id.clone())
    }

    fn to_token(&self) -> Token {
        Token::Tuple(vec![Token::String(self.degree_id.clone())])
    }

    fn from_tokens(tokens: Vec<Token>) -> Result<Self> {
        match tokens.into_iter().next() {
            Some(Token::Tuple(fields)) => match fields.into_iter().next() {
                Some(Token::String(degree_id)) => Ok(AcademicRecord { degree_id }),
                other => Err(Error::InvalidResponse(format!(
                    "unexpected degreeId field {:?}",
                    other
                ))),
            },
            other => Err(Error::InvalidResponse(format!(
                "unexpected academic details {:?}",
                other
            ))),
        }
    }
}

/// A transaction the node accepted but that may not be mined yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransaction {
    pub hash: H256,
}

impl fmt::Display for PendingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hash(&self.hash))
    }
}

/// Result of submitting a contract creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployment {
    pub address: Address,
    pub transaction: PendingTransaction,
}

/// Signing identity + call context + (once bound) the registry contract.
///
/// Starts unbound; [`Session::deploy`] or [`Session::load`] binds it.
/// [`Session::set_record`] and [`Session::get_record`] fail with
/// [`Error::Unbound`] until then.
pub struct Session<L> {
    ledger: L,
    signer: Signer,
    /// `from` used for read-only calls
    call_from: Address,
    contract: Option<Address>,
    abi: ethabi::Contract,
}

impl<L: Ledger> Session<L> {
    /// Derive the signing identity. Fails with [`Error::Auth`] when the key
    /// cannot be parsed or the passphrase is wrong.
    pub fn new(ledger: L, key: &str, passphrase: &str) -> Result<Self> {
        let signer = Signer::from_key_material(key, passphrase)?;
        Ok(Session {
            ledger,
            call_from: signer.address(),
            signer,
            contract: None,
            abi: identity_abi()?,
        })
    }

    /// Address of the signing identity
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Bound contract, if any
    pub fn contract(&self) -> Option<Address> {
        self.contract
    }

    pub fn is_bound(&self) -> bool {
        self.contract.is_some()
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }

    /// Submit a contract creation with `bytecode` and bind the session to the
    /// address it will live at. Returns without waiting for the block.
    pub fn deploy(&mut self, bytecode: &[u8]) -> Result<Deployment> {
        if bytecode.is_empty() {
            return Err(Error::Deploy("empty contract bytecode".into()));
        }
        let (transaction, nonce) = self
            .transact(None, bytecode.to_vec())
            .map_err(|e| Error::Deploy(e.to_string()))?;
        let address = contract_address(&self.signer.address(), nonce);

        info!(
            contract = %format_address(&address),
            tx = %transaction,
            "Registry contract deployment submitted"
        );
        self.contract = Some(address);
        Ok(Deployment {
            address,
            transaction,
        })
    }

    /// Bind an already deployed contract.
    ///
    /// Nothing checks that code exists at `address` or that this identity may
    /// write to it. A stale or foreign address only shows up as failures of
    /// later calls; making sure the address is the right one is on the caller.
    pub fn load(&mut self, address: &str) -> Result<()> {
        let address = parse_address(address)
            .map_err(|e| Error::Load(format!("invalid contract address {:?}: {}", address, e)))?;
        debug!(contract = %format_address(&address), "Registry contract loaded");
        self.contract = Some(address);
        Ok(())
    }

    /// Store `record` under `student_id`. The returned transaction is only
    /// submitted.
    pub fn set_record(
        &self,
        student_id: &str,
        record: &AcademicRecord,
    ) -> Result<PendingTransaction> {
        let contract = self.contract.ok_or(Error::Unbound)?;
        let data = self
            .abi
            .function(SET_ACADEMIC_DETAILS)
            .and_then(|f| f.encode_input(&[Token::String(student_id.to_string()), record.to_token()]))
            .map_err(|e| Error::ContractCall(e.to_string()))?;

        let (pending, _) = self
            .transact(Some(contract), data)
            .map_err(|e| Error::ContractCall(e.to_string()))?;
        info!(student_id, degree_id = %record.degree_id, tx = %pending, "Academic details submitted");
        Ok(pending)
    }

    /// Read the record stored under `student_id` from the latest state.
    pub fn get_record(&self, student_id: &str) -> Result<AcademicRecord> {
        let contract = self.contract.ok_or(Error::Unbound)?;
        self.query(contract, student_id)
            .map_err(|e| Error::ContractCall(e.to_string()))
    }

    fn query(&self, contract: Address, student_id: &str) -> Result<AcademicRecord> {
        let function = self.abi.function(GET_ACADEMIC_DETAILS)?;
        let data = function.encode_input(&[Token::String(student_id.to_string())])?;
        let output = self.ledger.call(&CallRequest {
            from: Some(self.call_from),
            to: Some(contract),
            data,
        })?;
        if output.is_empty() {
            return Err(Error::InvalidResponse(format!(
                "no contract code at {}",
                format_address(&contract)
            )));
        }
        AcademicRecord::from_tokens(function.decode_output(&output)?)
    }

    /// Sign and submit a transaction with node-suggested nonce, gas price
    /// and gas limit. Returns the pending transaction and the nonce used.
    fn transact(&self, to: Option<Address>, data: Vec<u8>) -> Result<(PendingTransaction, u64)> {
        let from = self.signer.address();
        let nonce = self.ledger.pending_nonce(from)?;
        let gas_price = self.ledger.gas_price()?;
        let gas = self.ledger.estimate_gas(&CallRequest {
            from: Some(from),
            to,
            data: data.clone(),
        })?;

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas,
            to,
            value: U256::zero(),
            data,
        };
        let signed = tx.sign(&self.signer, self.ledger.chain_id())?;
        debug!(nonce, %gas, %gas_price, "Sending transaction");
        let hash = self.ledger.send_raw_transaction(&signed.raw)?;
        if hash != signed.hash {
            debug!(node = %format_hash(&hash), local = %format_hash(&signed.hash), "Node reported a different transaction hash");
        }
        Ok((PendingTransaction { hash }, nonce))
    }
}

/// Decode `solc --bin` output (hex, optional `0x`, surrounding whitespace).
pub fn parse_bytecode(text: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(strip_0x(text.trim()))
        .map_err(|e| Error::Deploy(format!("invalid bytecode: {}", e)))?;
    if bytes.is_empty() {
        return Err(Error::Deploy("empty contract bytecode".into()));
    }
    Ok(bytes)
}
