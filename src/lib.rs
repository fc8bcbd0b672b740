// Library root
// -----------
// This crate exposes the pieces the `studentid` binary wires together to
// store and retrieve academic records: documents go to IPFS, and their
// content identifier is recorded in a registry contract keyed by student id.
//
// Module responsibilities:
// - `config`: the `.env` settings file (endpoint, key, contract address).
// - `storage`: upload/download against a local IPFS node.
// - `ledger`: JSON-RPC access to an Ethereum node, signing and encoding.
// - `registry`: the session bound to the registry contract (set/get record).
// - `ui`: session startup and the interactive menu.
//
// Storage and ledger sit behind traits so the menu and the session can be
// exercised without either node running.
pub mod config;
pub mod error;
pub mod ledger;
pub mod registry;
pub mod storage;
pub mod ui;

#[cfg(test)]
pub mod testing;

pub use error::{Error, Result};
