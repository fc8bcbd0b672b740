// Signing identity
//
// Turns configured key material into a secp256k1 signing key and the
// Ethereum address it controls.

use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use super::{keccak256, strip_0x, Address};
use crate::error::{Error, Result};

/// Signature over a 32-byte prehash, with the recovery bit Ethereum needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

pub struct Signer {
    key: SigningKey,
    address: Address,
}

impl Signer {
    /// Derive a signer from `KEY`/`KEYPASS` style configuration.
    ///
    /// Accepted forms, tried in order:
    /// - inline keystore v3 JSON (starts with `{`), decrypted with `passphrase`
    /// - a raw 32-byte hex private key; `passphrase` is ignored
    /// - a path to a keystore v3 file, decrypted with `passphrase`
    pub fn from_key_material(material: &str, passphrase: &str) -> Result<Self> {
        let material = material.trim();
        if material.is_empty() {
            return Err(Error::Auth("no signing key configured".into()));
        }

        let secret = if material.starts_with('{') {
            decrypt_keystore_json(material, passphrase)?
        } else if is_raw_key(material) {
            debug!("Using raw hex signing key");
            hex::decode(strip_0x(material))?
        } else if Path::new(material).is_file() {
            eth_keystore::decrypt_key(material, passphrase)
                .map_err(|e| Error::Auth(format!("cannot decrypt keystore {}: {}", material, e)))?
        } else {
            return Err(Error::Auth(
                "key material is neither a keystore nor a hex private key".into(),
            ));
        };

        let signer = Self::from_secret(&secret)?;
        info!(address = %super::format_address(&signer.address), "Loaded signing key");
        Ok(signer)
    }

    /// Whether `material` is a keystore that needs a passphrase to unlock.
    pub fn needs_passphrase(material: &str) -> bool {
        let material = material.trim();
        !material.is_empty() && !is_raw_key(material)
    }

    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(secret)
            .map_err(|_| Error::Auth("invalid secp256k1 private key".into()))?;
        let address = address_of(key.verifying_key());
        Ok(Signer { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a 32-byte hash as-is (no further hashing), low-S normalised.
    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<RecoverableSignature> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash)
            .map_err(|e| Error::Auth(format!("signing failed: {}", e)))?;
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(RecoverableSignature {
            r,
            s,
            recovery_id: recovery_id.to_byte(),
        })
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Ethereum address controlled by a public key.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.as_affine().to_encoded_point(false);
    // Uncompressed SEC1: 0x04 || X || Y; the address hashes X || Y.
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

fn is_raw_key(material: &str) -> bool {
    let hex_part = strip_0x(material);
    hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

/// `eth-keystore` only reads from disk, so stage the document in a temp file.
fn decrypt_keystore_json(json: &str, passphrase: &str) -> Result<Vec<u8>> {
    let mut staged = tempfile::NamedTempFile::new()?;
    staged.write_all(json.as_bytes())?;
    staged.flush()?;
    eth_keystore::decrypt_key(staged.path(), passphrase)
        .map_err(|e| Error::Auth(format!("cannot decrypt keystore: {}", e)))
}
