// Configuration store: a flat `.env` file that holds the ledger endpoint,
// the signing key and passphrase, and the deployed contract address.
//
// The file is the single source of truth. Every update re-reads it, changes
// one key and writes the whole mapping back. There is no locking; the tool is
// single-user and single-process.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Ledger node endpoint URL
pub const GATEWAY: &str = "GATEWAY";
/// Signing key material (keystore JSON, keystore path or raw hex key)
pub const KEY: &str = "KEY";
/// Passphrase for the keystore in `KEY`
pub const KEYPASS: &str = "KEYPASS";
/// Deployed registry contract address; empty until deployed
pub const CONTRACT_ADDR: &str = "CONTRACTADDR";
/// Storage node address (host:port)
pub const IPFS: &str = "IPFS";
/// Optional path to registry bytecode to deploy instead of the built-in one
pub const CONTRACT_BIN: &str = "CONTRACTBIN";

pub const DEFAULT_IPFS: &str = "localhost:5001";

/// Default location of the configuration file, relative to the working dir.
pub const DEFAULT_PATH: &str = ".env";
/// Environment variable that overrides [`DEFAULT_PATH`].
pub const PATH_ENV: &str = "STUDENTID_ENV";

/// Loaded key/value settings. Missing keys read as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings(BTreeMap<String, String>);

impl Settings {
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    /// Value for `key`, or `default` when the key is missing or empty.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.get(key) {
            "" => default,
            v => v,
        }
    }

    /// Whether the key is present at all (an empty value still counts).
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Settings {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Settings(iter.into_iter().collect())
    }
}

/// Handle on the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `$STUDENTID_ENV`, or `.env` in the working directory.
    pub fn from_env() -> Self {
        let path = std::env::var(PATH_ENV).unwrap_or_else(|_| DEFAULT_PATH.into());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file. A missing or unreadable file is logged and yields an
    /// empty mapping so callers only ever see empty values.
    pub fn load(&self) -> Settings {
        match self.read() {
            Ok(settings) => {
                debug!(path = %self.path.display(), keys = settings.len(), "Loaded configuration");
                settings
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not load configuration");
                Settings::default()
            }
        }
    }

    fn read(&self) -> std::result::Result<Settings, dotenvy::Error> {
        dotenvy::from_path_iter(&self.path)?.collect()
    }

    /// Read-modify-write a single key. A missing file starts out empty; a
    /// file that cannot be read or parsed is left untouched and reported.
    /// Not atomic: a failed write may leave the file truncated.
    pub fn update(&self, key: &str, value: &str) -> Result<()> {
        let mut settings = match self.read() {
            Ok(settings) => settings,
            Err(e) if e.not_found() => Settings::default(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    key,
                    error = %e,
                    "Refusing to rewrite unreadable configuration"
                );
                return Err(Error::Configuration(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        settings.set(key, value);
        self.save(&settings).map_err(|e| {
            warn!(path = %self.path.display(), key, error = %e, "Failed to update configuration");
            e
        })
    }

    /// Overwrite the file with `settings`.
    pub fn save(&self, settings: &Settings) -> Result<()> {
        fs::write(&self.path, render(settings)).map_err(|e| {
            Error::Configuration(format!("cannot write {}: {}", self.path.display(), e))
        })
    }
}

/// Serialise settings one `KEY=value` per line, sorted by key. Integers are
/// written bare, everything else double-quoted.
fn render(settings: &Settings) -> String {
    let mut out = String::new();
    for (key, value) in settings.iter() {
        let is_integer = value
            .parse::<i64>()
            .map(|n| n.to_string() == value)
            .unwrap_or(false);
        if is_integer {
            let _ = writeln!(out, "{}={}", key, value);
        } else {
            let _ = writeln!(out, "{}=\"{}\"", key, escape(value));
        }
    }
    out
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '$' => escaped.push_str("\\$"),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}
