// In-memory stand-ins for the ledger node and the storage node, plus a
// canned-response HTTP server for the real clients.
//
// `FakeChain` decodes the signed RLP transactions and ABI calldata the
// session produces, recovers the sender and runs the registry contract
// logic, so session and controller tests cover the real encoding path.
// `MemoryStore` snapshots uploaded paths and hands out sequential
// identifiers (`cid1`, `cid2`, ...). `StubServer` answers HTTP on a local
// port so `RpcClient` and `IpfsClient` can be driven over a real socket.
//
// Fake handles are cheap clones sharing one state, so a test can keep one
// copy for assertions while the code under test owns another.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;

use ethabi::Token;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use rlp::Rlp;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::ledger::{
    address_of, contract_address, keccak256, Address, CallRequest, Ledger, LegacyTransaction,
    H256, U256,
};
use crate::registry::identity_abi;
use crate::storage::{ContentId, ContentStore};

/// Raw private key used by tests (the EIP-155 example key).
pub const TEST_KEY: &str = "0x4646464646464646464646464646464646464646464646464646464646464646";

pub const TEST_CHAIN_ID: u64 = 1337;

#[derive(Default)]
struct ChainState {
    nonces: HashMap<Address, u64>,
    contracts: Vec<Address>,
    code: HashMap<Address, Vec<u8>>,
    storage: HashMap<Address, HashMap<String, String>>,
    submitted: Vec<H256>,
}

#[derive(Clone, Default)]
pub struct FakeChain {
    state: Rc<RefCell<ChainState>>,
}

fn revert(message: &str) -> Error {
    Error::Rpc {
        code: -32000,
        message: message.to_string(),
    }
}

fn malformed(e: rlp::DecoderError) -> Error {
    Error::Rpc {
        code: -32602,
        message: format!("rlp: {}", e),
    }
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contracts created so far, in creation order.
    pub fn contracts(&self) -> Vec<Address> {
        self.state.borrow().contracts.clone()
    }

    /// Creation code a contract was deployed with.
    pub fn code(&self, address: &Address) -> Option<Vec<u8>> {
        self.state.borrow().code.get(address).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.state.borrow().submitted.len()
    }

    pub fn was_submitted(&self, hash: &H256) -> bool {
        self.state.borrow().submitted.contains(hash)
    }

    pub fn nonce_of(&self, address: &Address) -> u64 {
        self.state.borrow().nonces.get(address).copied().unwrap_or(0)
    }

    pub fn record(&self, contract: &Address, student_id: &str) -> Option<String> {
        self.state
            .borrow()
            .storage
            .get(contract)
            .and_then(|records| records.get(student_id).cloned())
    }

    fn recover_sender(tx: &LegacyTransaction, v: u64, r: U256, s: U256) -> Result<Address> {
        let recovery = v
            .checked_sub(35 + 2 * TEST_CHAIN_ID)
            .and_then(|id| u8::try_from(id).ok())
            .and_then(RecoveryId::from_byte)
            .ok_or_else(|| revert("invalid chain id"))?;
        let mut rs = [0u8; 64];
        r.to_big_endian(&mut rs[..32]);
        s.to_big_endian(&mut rs[32..]);
        let signature = Signature::from_slice(&rs).map_err(|_| revert("invalid signature"))?;
        let key = VerifyingKey::recover_from_prehash(
            &tx.signing_hash(TEST_CHAIN_ID),
            &signature,
            recovery,
        )
        .map_err(|_| revert("invalid sender"))?;
        Ok(address_of(&key))
    }

    fn execute(&self, sender: Address, tx: &LegacyTransaction) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match tx.to {
            None => {
                let address = contract_address(&sender, tx.nonce);
                state.contracts.push(address);
                state.code.insert(address, tx.data.clone());
                state.storage.insert(address, HashMap::new());
            }
            Some(to) => {
                // Plain transfer to an account without code.
                let Some(records) = state.storage.get_mut(&to) else {
                    return Ok(());
                };
                let abi = identity_abi()?;
                let set = abi.function("setAcademicDetails")?;
                if tx.data.len() < 4 || tx.data[..4] != set.short_signature() {
                    return Err(revert("execution reverted"));
                }
                let mut tokens = set.decode_input(&tx.data[4..])?.into_iter();
                let student_id = tokens.next().and_then(Token::into_string);
                let degree_id = tokens
                    .next()
                    .and_then(Token::into_tuple)
                    .and_then(|fields| fields.into_iter().next())
                    .and_then(Token::into_string);
                match (student_id, degree_id) {
                    (Some(student_id), Some(degree_id)) => {
                        records.insert(student_id, degree_id);
                    }
                    _ => return Err(revert("execution reverted")),
                }
            }
        }
        Ok(())
    }
}

impl Ledger for FakeChain {
    fn chain_id(&self) -> u64 {
        TEST_CHAIN_ID
    }

    fn pending_nonce(&self, address: Address) -> Result<u64> {
        Ok(self.nonce_of(&address))
    }

    fn gas_price(&self) -> Result<U256> {
        Ok(U256::from(1_000_000_000u64))
    }

    fn estimate_gas(&self, _request: &CallRequest) -> Result<U256> {
        Ok(U256::from(100_000u64))
    }

    fn call(&self, request: &CallRequest) -> Result<Vec<u8>> {
        let Some(to) = request.to else {
            return Ok(Vec::new());
        };
        let state = self.state.borrow();
        let Some(records) = state.storage.get(&to) else {
            // No code at the address: empty return data, like a real node.
            return Ok(Vec::new());
        };

        let abi = identity_abi()?;
        let get = abi.function("getAcademicDetails")?;
        if request.data.len() < 4 || request.data[..4] != get.short_signature() {
            return Err(revert("execution reverted"));
        }
        let student_id = get
            .decode_input(&request.data[4..])?
            .into_iter()
            .next()
            .and_then(Token::into_string)
            .ok_or_else(|| revert("execution reverted"))?;
        let degree_id = records.get(&student_id).cloned().unwrap_or_default();
        Ok(ethabi::encode(&[Token::Tuple(vec![Token::String(degree_id)])]))
    }

    fn send_raw_transaction(&self, raw: &[u8]) -> Result<H256> {
        let rlp = Rlp::new(raw);
        let to_item = rlp.at(3).map_err(malformed)?;
        let tx = LegacyTransaction {
            nonce: rlp.val_at(0).map_err(malformed)?,
            gas_price: rlp.val_at(1).map_err(malformed)?,
            gas: rlp.val_at(2).map_err(malformed)?,
            to: if to_item.is_empty() {
                None
            } else {
                Some(to_item.as_val().map_err(malformed)?)
            },
            value: rlp.val_at(4).map_err(malformed)?,
            data: rlp.val_at(5).map_err(malformed)?,
        };
        let v: u64 = rlp.val_at(6).map_err(malformed)?;
        let r: U256 = rlp.val_at(7).map_err(malformed)?;
        let s: U256 = rlp.val_at(8).map_err(malformed)?;

        let sender = Self::recover_sender(&tx, v, r, s)?;
        let expected = self.nonce_of(&sender);
        if tx.nonce != expected {
            return Err(revert(&format!(
                "invalid nonce: have {}, want {}",
                tx.nonce, expected
            )));
        }

        self.execute(sender, &tx)?;
        let hash = H256::from(keccak256(raw));
        let mut state = self.state.borrow_mut();
        state.nonces.insert(sender, expected + 1);
        state.submitted.push(hash);
        Ok(hash)
    }
}

enum Snapshot {
    File(Vec<u8>),
    /// Relative paths; `None` marks a directory.
    Dir(Vec<(PathBuf, Option<Vec<u8>>)>),
}

struct StoreState {
    reachable: bool,
    next: u64,
    objects: HashMap<ContentId, Snapshot>,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Rc<RefCell<StoreState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore {
            state: Rc::new(RefCell::new(StoreState {
                reachable: true,
                next: 1,
                objects: HashMap::new(),
            })),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        let store = Self::default();
        store.state.borrow_mut().reachable = false;
        store
    }

    pub fn uploads(&self) -> usize {
        self.state.borrow().objects.len()
    }

    fn snapshot(root: &Path, rel: &Path, entries: &mut Vec<(PathBuf, Option<Vec<u8>>)>) -> Result<()> {
        let mut children: Vec<_> = fs::read_dir(root.join(rel))?.collect::<std::io::Result<_>>()?;
        children.sort_by_key(|c| c.file_name());
        for child in children {
            let child_rel = rel.join(child.file_name());
            if child.path().is_dir() {
                entries.push((child_rel.clone(), None));
                Self::snapshot(root, &child_rel, entries)?;
            } else {
                entries.push((child_rel, Some(fs::read(child.path())?)));
            }
        }
        Ok(())
    }
}

impl ContentStore for MemoryStore {
    fn is_reachable(&self) -> bool {
        self.state.borrow().reachable
    }

    fn upload_directory(&self, path: &Path) -> Result<ContentId> {
        let snapshot = if path.is_dir() {
            let mut entries = Vec::new();
            Self::snapshot(path, Path::new(""), &mut entries)
                .map_err(|e| Error::Upload(e.to_string()))?;
            Snapshot::Dir(entries)
        } else {
            let bytes = fs::read(path)
                .map_err(|e| Error::Upload(format!("{}: {}", path.display(), e)))?;
            Snapshot::File(bytes)
        };

        let mut state = self.state.borrow_mut();
        let id = ContentId::new(format!("cid{}", state.next));
        state.next += 1;
        state.objects.insert(id.clone(), snapshot);
        Ok(id)
    }

    fn download(&self, id: &ContentId, target: &Path) -> Result<()> {
        let state = self.state.borrow();
        let snapshot = state
            .objects
            .get(id)
            .ok_or_else(|| Error::Download(format!("{}: not found", id)))?;
        match snapshot {
            Snapshot::File(bytes) => fs::write(target, bytes)?,
            Snapshot::Dir(entries) => {
                fs::create_dir_all(target)?;
                for (rel, contents) in entries {
                    match contents {
                        None => fs::create_dir_all(target.join(rel))?,
                        Some(bytes) => fs::write(target.join(rel), bytes)?,
                    }
                }
            }
        }
        Ok(())
    }
}

/// One request as seen by [`StubServer`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    /// Path plus query string
    pub target: String,
    /// Lowercased names
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    /// Decoded value of a query parameter.
    pub fn query(&self, key: &str) -> Option<String> {
        let url = reqwest::Url::parse(&format!("http://stub{}", self.target)).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Canned HTTP response.
pub struct Reply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    pub fn json(value: Value) -> Self {
        Reply {
            status: 200,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    pub fn text(body: &str) -> Self {
        Reply {
            status: 200,
            content_type: "text/plain",
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn bytes(body: &[u8]) -> Self {
        Reply {
            status: 200,
            content_type: "application/octet-stream",
            body: body.to_vec(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply {
            status,
            content_type: "application/json",
            body: body.as_bytes().to_vec(),
        }
    }
}

/// HTTP/1.1 server on an ephemeral local port. Connections are served one
/// at a time and closed after each response. The accept thread lives until
/// the test process exits.
pub struct StubServer {
    address: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl StubServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Recorded) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let Ok(request) = read_request(&stream) else { continue };
                let reply = handler(&request);
                log.lock().unwrap().push(request);
                let _ = write_reply(&stream, &reply);
            }
        });

        StubServer { address, requests }
    }

    /// JSON-RPC 2.0 node. `handler` gets the method and params and returns
    /// either the result or the error object.
    pub fn json_rpc<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> std::result::Result<Value, Value> + Send + 'static,
    {
        Self::start(move |request| {
            let call: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
            let id = call["id"].clone();
            let method = call["method"].as_str().unwrap_or_default();
            match handler(method, &call["params"]) {
                Ok(result) => Reply::json(json!({"jsonrpc": "2.0", "id": id, "result": result})),
                Err(error) => Reply::json(json!({"jsonrpc": "2.0", "id": id, "error": error})),
            }
        })
    }

    /// `http://127.0.0.1:<port>`
    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// `127.0.0.1:<port>`
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

fn read_request(stream: &TcpStream) -> io::Result<Recorded> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut request_line = line.split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    let mut request = Recorded {
        method,
        target,
        headers,
        body: Vec::new(),
    };
    if let Some(len) = request
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        request.body.resize(len, 0);
        reader.read_exact(&mut request.body)?;
    } else if request
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        request.body = read_chunked(&mut reader)?;
    }
    Ok(request)
}

fn read_chunked<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let size_field = line.trim().split(';').next().unwrap_or_default();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if size == 0 {
            // Trailers, then the blank line.
            loop {
                line.clear();
                if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
                    return Ok(body);
                }
            }
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..])?;
        line.clear();
        reader.read_line(&mut line)?;
    }
}

fn write_reply(mut stream: &TcpStream, reply: &Reply) -> io::Result<()> {
    let reason = if reply.status < 400 { "OK" } else { "Error" };
    write!(
        stream,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reply.status,
        reason,
        reply.content_type,
        reply.body.len()
    )?;
    stream.write_all(&reply.body)?;
    stream.flush()
}
