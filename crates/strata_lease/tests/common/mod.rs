#![allow(dead_code)]
//! Shared harness for lease-manager integration tests: a small in-process
//! cluster of lease managers over one shared KV engine and gossip wire.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use strata_base::hlc::{Clock, Timestamp};
use strata_base::node::NodeIdContainer;
use strata_base::stop::Stopper;
use strata_kv::{keys, Db, Gossip, MemEngine, Txn};
use strata_lease::descriptor::{
    normalize_name, ColumnDescriptor, Descriptor, DescriptorState, DescriptorVersion,
    TableDescriptor, FORMAT_VERSION_CURRENT,
};
use strata_lease::knobs::LeaseManagerTestingKnobs;
use strata_lease::{LeaseManager, LeaseManagerConfig};

/// Database id every test table lives in.
pub const DB_ID: u64 = 1;

pub struct TestNode {
    pub manager: Arc<LeaseManager>,
    pub stopper: Arc<Stopper>,
}

pub struct TestCluster {
    pub db: Arc<Db>,
    pub gossip: Arc<Gossip>,
    pub clock: Arc<Clock>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// A cluster of `knobs.len()` nodes sharing one engine, gossip wire,
    /// and clock. Node ids start at 1.
    pub fn new(config: LeaseManagerConfig, knobs: Vec<LeaseManagerTestingKnobs>) -> TestCluster {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();

        let gossip = Arc::new(Gossip::new());
        let db = Arc::new(Db::new(Arc::new(MemEngine::new()), gossip.clone()));
        let clock = Arc::new(Clock::system());

        let nodes = knobs
            .into_iter()
            .enumerate()
            .map(|(i, node_knobs)| {
                let node_id = Arc::new(NodeIdContainer::new());
                node_id.set(i as u64 + 1);
                let stopper = Arc::new(Stopper::new());
                let manager = Arc::new(LeaseManager::new(
                    node_id,
                    db.clone(),
                    clock.clone(),
                    config,
                    node_knobs,
                    stopper.clone(),
                ));
                TestNode { manager, stopper }
            })
            .collect();

        TestCluster {
            db,
            gossip,
            clock,
            nodes,
        }
    }

    pub fn single(config: LeaseManagerConfig, knobs: LeaseManagerTestingKnobs) -> TestCluster {
        TestCluster::new(config, vec![knobs])
    }

    pub fn manager(&self, i: usize) -> &Arc<LeaseManager> {
        &self.nodes[i].manager
    }

    /// Starts the gossip-driven refresh worker on node `i`.
    pub fn start_refresh(&self, i: usize) {
        self.nodes[i].manager.refresh_leases(
            &self.nodes[i].stopper,
            self.db.clone(),
            self.gossip.clone(),
        );
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.stopper.stop().await;
        }
    }
}

/// Writes a version-1 table descriptor and its name-index entry, with the
/// system-config trigger set so refresh workers hear about it.
pub async fn create_table(db: &Db, clock: &Clock, id: u64, name: &str) {
    let desc = Descriptor::Table(TableDescriptor {
        id,
        name: name.to_string(),
        parent_id: DB_ID,
        version: 1,
        modification_time: clock.now(),
        format_version: FORMAT_VERSION_CURRENT,
        state: DescriptorState::Public,
        columns: vec![
            ColumnDescriptor {
                id: 1,
                name: "id".to_string(),
            },
            ColumnDescriptor {
                id: 2,
                name: "value".to_string(),
            },
        ],
    });
    db.run_txn(|txn: &Txn| {
        let desc = desc.clone();
        let name = name.to_string();
        Box::pin(async move {
            txn.set_system_config_trigger();
            txn.put(keys::descriptor_key(id), desc.to_bytes()?);
            txn.put(
                keys::name_index_key(DB_ID, &normalize_name(&name)),
                id.to_be_bytes().to_vec(),
            );
            Ok(())
        })
    })
    .await
    .expect("create table");
}

/// Repoints the name index from `old` to `new`, the way a schema changer
/// finishes a rename after the descriptor itself was published.
pub async fn move_name_index(db: &Db, old: &str, new: &str, id: u64) {
    db.run_txn(|txn: &Txn| {
        let old = old.to_string();
        let new = new.to_string();
        Box::pin(async move {
            txn.delete(keys::name_index_key(DB_ID, &normalize_name(&old)));
            txn.put(
                keys::name_index_key(DB_ID, &normalize_name(&new)),
                id.to_be_bytes().to_vec(),
            );
            Ok(())
        })
    })
    .await
    .expect("move name index");
}

/// Every row currently in `system.lease`.
pub async fn lease_rows(db: &Db) -> Vec<keys::LeaseRowKey> {
    db.run_txn(|txn: &Txn| {
        Box::pin(async move {
            let rows = txn.scan_prefix(&keys::lease_table_prefix()).await?;
            rows.iter()
                .map(|(key, _)| keys::decode_lease_row_key(key))
                .collect::<Result<Vec<_>>>()
        })
    })
    .await
    .expect("scan lease rows")
}

pub async fn lease_rows_at_version(db: &Db, id: u64, version: DescriptorVersion) -> usize {
    lease_rows(db)
        .await
        .into_iter()
        .filter(|row| row.desc_id == id && row.version == version)
        .count()
}

/// Acquires through the manager under a fresh transaction, the way SQL
/// execution does.
pub async fn acquire(
    manager: &Arc<LeaseManager>,
    db: &Db,
    id: u64,
    version: DescriptorVersion,
) -> Result<(TableDescriptor, Timestamp)> {
    let manager = manager.clone();
    db.run_txn(|txn: &Txn| {
        let manager = manager.clone();
        Box::pin(async move { manager.acquire(txn, id, version).await })
    })
    .await
}

pub async fn acquire_by_name(
    manager: &Arc<LeaseManager>,
    db: &Db,
    db_id: u64,
    name: &str,
) -> Result<(TableDescriptor, Timestamp)> {
    let manager = manager.clone();
    db.run_txn(|txn: &Txn| {
        let manager = manager.clone();
        let name = name.to_string();
        Box::pin(async move { manager.acquire_by_name(txn, db_id, &name).await })
    })
    .await
}

/// Knobs that count store acquisition round trips.
pub fn counting_knobs() -> (LeaseManagerTestingKnobs, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let mut knobs = LeaseManagerTestingKnobs::default();
    let counter = count.clone();
    knobs.lease_store.lease_acquiring_event = Some(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    (knobs, count)
}

/// Polls `f` until it reports true, panicking after five seconds.
pub async fn wait_for<F, Fut>(what: &str, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if f().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
