//! Transactional client over a [`KvEngine`].
//!
//! Transactions buffer writes, read their own writes, and validate at
//! commit time that every key they read is unchanged (first committer
//! wins). A failed validation surfaces as [`RetryableTxnError`], which
//! [`Db::run_txn`] retries with backoff and a fresh transaction.
//!
//! Committing a transaction whose system-config trigger is set publishes a
//! fresh snapshot of the system span to gossip.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use futures_util::future::BoxFuture;

use strata_base::retry;

use crate::engine::{KvEngine, Mutation, Sequence};
use crate::gossip::{Gossip, SystemConfig};
use crate::keys;

/// A transaction lost a write conflict and should be run again from the
/// top. Recognized and retried by [`Db::run_txn`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryableTxnError;

impl fmt::Display for RetryableTxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("restart transaction: conflicting committed write")
    }
}

impl std::error::Error for RetryableTxnError {}

/// An ordered set of writes applied to a transaction in one call.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Batch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

struct TxnInner {
    /// Key -> sequence observed by the first read of that key.
    reads: HashMap<Vec<u8>, Sequence>,
    /// Buffered writes; `None` is a pending delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    committed: bool,
    system_config_trigger: bool,
}

pub struct Txn {
    engine: Arc<dyn KvEngine>,
    gossip: Arc<Gossip>,
    commit_lock: Arc<Mutex<()>>,
    inner: Mutex<TxnInner>,
}

impl Txn {
    /// Reads `key`, observing the transaction's own buffered writes first.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        {
            let inner = self.inner.lock().expect("txn lock");
            if let Some(buffered) = inner.writes.get(key) {
                return Ok(buffered.clone());
            }
        }
        // Capture the sequence before the value: if a commit lands between
        // the two reads, validation fails and the transaction restarts.
        let sequence = self.engine.key_sequence(key);
        let value = self.engine.get(key).map(|(value, _)| value);
        let mut inner = self.inner.lock().expect("txn lock");
        inner.reads.entry(key.to_vec()).or_insert(sequence);
        Ok(value)
    }

    /// Live rows under `prefix`, with buffered writes layered on top.
    pub async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let end = keys::prefix_end(prefix);
        let rows = self.engine.scan_range(prefix, &end);
        let mut inner = self.inner.lock().expect("txn lock");
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, value, sequence) in rows {
            inner.reads.entry(key.clone()).or_insert(sequence);
            merged.insert(key, value);
        }
        let in_range = inner
            .writes
            .range::<[u8], _>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))
            .map(|(key, write)| (key.clone(), write.clone()))
            .collect::<Vec<_>>();
        for (key, write) in in_range {
            match write {
                Some(value) => {
                    merged.insert(key, value);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut inner = self.inner.lock().expect("txn lock");
        inner.writes.insert(key, Some(value));
    }

    pub fn delete(&self, key: Vec<u8>) {
        let mut inner = self.inner.lock().expect("txn lock");
        inner.writes.insert(key, None);
    }

    /// Marks this transaction so its commit gossips a new system config.
    /// Must be set before the descriptor write it is meant to announce.
    pub fn set_system_config_trigger(&self) {
        let mut inner = self.inner.lock().expect("txn lock");
        inner.system_config_trigger = true;
    }

    pub fn new_batch(&self) -> Batch {
        Batch::default()
    }

    /// Applies a batch to the transaction's write set.
    pub async fn run(&self, batch: Batch) -> Result<()> {
        let mut inner = self.inner.lock().expect("txn lock");
        if inner.committed {
            bail!("transaction already committed");
        }
        for (key, write) in batch.ops {
            inner.writes.insert(key, write);
        }
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        let (reads, writes, trigger) = {
            let mut inner = self.inner.lock().expect("txn lock");
            if inner.committed {
                bail!("transaction already committed");
            }
            inner.committed = true;
            (
                std::mem::take(&mut inner.reads),
                std::mem::take(&mut inner.writes),
                inner.system_config_trigger,
            )
        };

        // Validation and apply are atomic with respect to other commits.
        let _commit_guard = self.commit_lock.lock().expect("commit lock");
        for (key, observed) in &reads {
            if self.engine.key_sequence(key) != *observed {
                return Err(anyhow!(RetryableTxnError));
            }
        }
        if !writes.is_empty() {
            let mutations = writes
                .into_iter()
                .map(|(key, write)| match write {
                    Some(value) => Mutation::Put { key, value },
                    None => Mutation::Delete { key },
                })
                .collect::<Vec<_>>();
            self.engine.apply(&mutations);
        }
        if trigger {
            let (start, end) = keys::system_span();
            let values = self
                .engine
                .scan_range(&start, &end)
                .into_iter()
                .map(|(key, value, _)| (key, value))
                .collect();
            self.gossip.broadcast_system_config(SystemConfig { values });
        }
        Ok(())
    }

    /// Applies `batch` and commits in one step.
    pub async fn commit_in_batch(&self, batch: Batch) -> Result<()> {
        self.run(batch).await?;
        self.commit().await
    }

    pub(crate) async fn maybe_commit(&self) -> Result<()> {
        if self.inner.lock().expect("txn lock").committed {
            return Ok(());
        }
        self.commit().await
    }
}

/// Handle to the transactional store shared by every component on a node.
#[derive(Clone)]
pub struct Db {
    engine: Arc<dyn KvEngine>,
    gossip: Arc<Gossip>,
    commit_lock: Arc<Mutex<()>>,
}

impl Db {
    pub fn new(engine: Arc<dyn KvEngine>, gossip: Arc<Gossip>) -> Db {
        Db {
            engine,
            gossip,
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn engine(&self) -> Arc<dyn KvEngine> {
        self.engine.clone()
    }

    pub fn gossip(&self) -> Arc<Gossip> {
        self.gossip.clone()
    }

    pub fn new_txn(&self) -> Txn {
        Txn {
            engine: self.engine.clone(),
            gossip: self.gossip.clone(),
            commit_lock: self.commit_lock.clone(),
            inner: Mutex::new(TxnInner {
                reads: HashMap::new(),
                writes: BTreeMap::new(),
                committed: false,
                system_config_trigger: false,
            }),
        }
    }

    /// Non-transactional read of the latest committed value.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.engine.get(key).map(|(value, _)| value))
    }

    /// Runs `f` in a transaction, retrying with backoff on write conflicts.
    /// The closure may commit explicitly; otherwise the transaction commits
    /// when the closure returns `Ok`.
    pub async fn run_txn<T, F>(&self, mut f: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnMut(&'a Txn) -> BoxFuture<'a, Result<T>> + Send,
    {
        let mut attempts = retry::start(retry::Options {
            initial_backoff: std::time::Duration::from_millis(5),
            max_backoff: std::time::Duration::from_millis(200),
            ..retry::Options::default()
        });
        while attempts.next().await {
            let txn = self.new_txn();
            match f(&txn).await {
                Ok(value) => match txn.maybe_commit().await {
                    Ok(()) => return Ok(value),
                    Err(err) if err.is::<RetryableTxnError>() => continue,
                    Err(err) => return Err(err),
                },
                Err(err) if err.is::<RetryableTxnError>() => continue,
                Err(err) => return Err(err),
            }
        }
        bail!("transaction retry budget exhausted")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::engine::MemEngine;

    fn test_db() -> Db {
        Db::new(Arc::new(MemEngine::new()), Arc::new(Gossip::new()))
    }

    #[tokio::test]
    async fn reads_see_buffered_writes() {
        let db = test_db();
        let txn = db.new_txn();
        txn.put(b"k".to_vec(), b"v".to_vec());
        assert_eq!(txn.get(b"k").await.expect("get"), Some(b"v".to_vec()));
        txn.delete(b"k".to_vec());
        assert_eq!(txn.get(b"k").await.expect("get"), None);
        txn.commit().await.expect("commit");
        assert_eq!(db.get(b"k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn conflicting_read_restarts_transaction() {
        let db = test_db();
        let txn = db.new_txn();
        assert_eq!(txn.get(b"k").await.expect("get"), None);

        // Another transaction commits a write to the key we read.
        let other = db.new_txn();
        other.put(b"k".to_vec(), b"x".to_vec());
        other.commit().await.expect("commit");

        txn.put(b"k".to_vec(), b"y".to_vec());
        let err = txn.commit().await.expect_err("conflict");
        assert!(err.is::<RetryableTxnError>());
        // The loser's write never landed.
        assert_eq!(db.get(b"k").await.expect("get"), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn run_txn_retries_conflicts() {
        let db = test_db();
        let attempts = Arc::new(AtomicUsize::new(0));
        db.run_txn(|txn: &Txn| {
            let attempts = attempts.clone();
            let db = db.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                let _ = txn.get(b"k").await?;
                if n == 0 {
                    // Invalidate our own read on the first attempt.
                    let other = db.new_txn();
                    other.put(b"k".to_vec(), b"interference".to_vec());
                    other.commit().await?;
                }
                txn.put(b"k".to_vec(), b"done".to_vec());
                Ok(())
            })
        })
        .await
        .expect("run_txn");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(db.get(b"k").await.expect("get"), Some(b"done".to_vec()));
    }

    #[tokio::test]
    async fn scan_prefix_layers_buffered_writes() {
        let db = test_db();
        db.run_txn(|txn: &Txn| {
            Box::pin(async move {
                txn.put(b"p/a".to_vec(), b"1".to_vec());
                txn.put(b"p/b".to_vec(), b"2".to_vec());
                txn.put(b"q/z".to_vec(), b"3".to_vec());
                Ok(())
            })
        })
        .await
        .expect("seed");

        let txn = db.new_txn();
        txn.delete(b"p/a".to_vec());
        txn.put(b"p/c".to_vec(), b"4".to_vec());
        let rows = txn.scan_prefix(b"p/").await.expect("scan");
        let keys = rows.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>();
        assert_eq!(keys, vec![b"p/b".as_slice(), b"p/c".as_slice()]);
    }

    #[tokio::test]
    async fn trigger_commit_broadcasts_system_config() {
        let db = test_db();
        let gossip = db.gossip();
        let mut rx = gossip.register_system_config_channel();

        db.run_txn(|txn: &Txn| {
            Box::pin(async move {
                txn.set_system_config_trigger();
                txn.put(keys::descriptor_key(1), b"desc".to_vec());
                Ok(())
            })
        })
        .await
        .expect("commit");

        rx.changed().await.expect("gossip");
        let config = gossip.get_system_config();
        assert_eq!(
            config.get(&keys::descriptor_key(1)),
            Some(b"desc".as_slice())
        );
    }
}
