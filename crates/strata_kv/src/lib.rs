//! Transactional key/value client for StrataDB nodes.
//!
//! This crate provides the storage-engine seam (`KvEngine` plus the
//! in-memory `MemEngine`), the transactional client (`Db`/`Txn`) with
//! first-committer-wins conflict detection, the system keyspace encodings,
//! and the gossip channel that distributes system-config snapshots.

pub mod db;
pub mod engine;
pub mod gossip;
pub mod keys;

pub use db::{Batch, Db, RetryableTxnError, Txn};
pub use engine::{KvEngine, MemEngine, Mutation, Sequence};
pub use gossip::{Gossip, SystemConfig};
