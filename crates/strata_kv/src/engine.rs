//! Storage engine seam and the in-memory engine.
//!
//! The engine stores raw bytes and stamps every committed mutation with a
//! node-local sequence number. Sequence numbers are what the transactional
//! layer validates against at commit time; deletions leave a sequence-bumped
//! tombstone behind so a read of an absent key can still be invalidated by
//! a later write or delete.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

/// Sequence number stamped on every committed mutation. `0` means the key
/// has never been written.
pub type Sequence = u64;

#[derive(Clone, Debug)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Storage engine API consumed by the transactional layer.
pub trait KvEngine: Send + Sync + 'static {
    /// Latest live value for `key`, with the sequence that wrote it.
    fn get(&self, key: &[u8]) -> Option<(Vec<u8>, Sequence)>;

    /// Sequence of the last mutation touching `key`, tombstones included.
    fn key_sequence(&self, key: &[u8]) -> Sequence;

    /// Live entries in `[start, end)` in key order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>, Sequence)>;

    /// Applies a batch atomically under one new sequence number.
    fn apply(&self, mutations: &[Mutation]) -> Sequence;

    fn current_sequence(&self) -> Sequence;
}

#[derive(Clone, Debug)]
struct VersionedValue {
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
    sequence: Sequence,
}

/// In-memory engine. Tombstones are kept forever; this engine backs tests
/// and single-process deployments, not durable storage.
pub struct MemEngine {
    inner: RwLock<MemInner>,
}

struct MemInner {
    data: BTreeMap<Vec<u8>, VersionedValue>,
    sequence: Sequence,
}

impl Default for MemEngine {
    fn default() -> MemEngine {
        MemEngine::new()
    }
}

impl MemEngine {
    pub fn new() -> MemEngine {
        MemEngine {
            inner: RwLock::new(MemInner {
                data: BTreeMap::new(),
                sequence: 0,
            }),
        }
    }
}

impl KvEngine for MemEngine {
    fn get(&self, key: &[u8]) -> Option<(Vec<u8>, Sequence)> {
        let inner = self.inner.read().expect("engine lock");
        let entry = inner.data.get(key)?;
        entry.value.clone().map(|v| (v, entry.sequence))
    }

    fn key_sequence(&self, key: &[u8]) -> Sequence {
        let inner = self.inner.read().expect("engine lock");
        inner.data.get(key).map_or(0, |entry| entry.sequence)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>, Sequence)> {
        let inner = self.inner.read().expect("engine lock");
        inner
            .data
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .filter_map(|(key, entry)| {
                entry
                    .value
                    .as_ref()
                    .map(|value| (key.clone(), value.clone(), entry.sequence))
            })
            .collect()
    }

    fn apply(&self, mutations: &[Mutation]) -> Sequence {
        let mut inner = self.inner.write().expect("engine lock");
        inner.sequence += 1;
        let sequence = inner.sequence;
        for mutation in mutations {
            match mutation {
                Mutation::Put { key, value } => {
                    inner.data.insert(
                        key.clone(),
                        VersionedValue {
                            value: Some(value.clone()),
                            sequence,
                        },
                    );
                }
                Mutation::Delete { key } => {
                    inner.data.insert(
                        key.clone(),
                        VersionedValue {
                            value: None,
                            sequence,
                        },
                    );
                }
            }
        }
        sequence
    }

    fn current_sequence(&self) -> Sequence {
        self.inner.read().expect("engine lock").sequence
    }
}
