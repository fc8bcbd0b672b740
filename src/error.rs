// Error types for the student identity client.
//
// One enum covers the whole flow. The first group of variants is what the
// controller reports to the user; the second group carries lower-level
// causes out of the ledger and storage clients.

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // ===== Reported failures =====
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Contract deployment failed: {0}")]
    Deploy(String),

    #[error("Contract load failed: {0}")]
    Load(String),

    #[error("Contract call failed: {0}")]
    ContractCall(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Session is not bound to a registry contract")]
    Unbound,

    // ===== Causes =====
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Storage node error: {status} - {message}")]
    Storage { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ABI error: {0}")]
    Abi(#[from] ethabi::Error),

    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Whether the process should stop rather than return to the menu.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Configuration(_)
                | Error::Auth(_)
                | Error::Deploy(_)
                | Error::Load(_)
        )
    }
}
