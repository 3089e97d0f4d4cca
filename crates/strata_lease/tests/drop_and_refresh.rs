//! Dropped tables and the gossip-driven refresh worker: unused leases are
//! released on drop, in-use leases drain on dereference, and new
//! acquisitions are refused.

mod common;

use std::sync::Arc;

use common::{acquire, create_table, lease_rows, wait_for, TestCluster};
use strata_kv::{keys, SystemConfig};
use strata_lease::descriptor::{Descriptor, DescriptorState};
use strata_lease::errors::TableDroppedError;
use strata_lease::knobs::LeaseManagerTestingKnobs;
use strata_lease::LeaseManagerConfig;
use tokio::sync::mpsc;

const TABLE_ID: u64 = 50;

/// Knobs that forward each refreshed system config to the test.
fn refresh_knobs() -> (
    LeaseManagerTestingKnobs,
    mpsc::UnboundedReceiver<SystemConfig>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut knobs = LeaseManagerTestingKnobs::default();
    knobs.leases_refreshed_event = Some(Arc::new(move |config: &SystemConfig| {
        let _ = tx.send(config.clone());
    }));
    (knobs, rx)
}

/// Waits until a refresh processed a config in which the table is dropped.
async fn wait_for_drop_refresh(rx: &mut mpsc::UnboundedReceiver<SystemConfig>) {
    loop {
        let config = rx.recv().await.expect("refresh worker alive");
        let Some(raw) = config.get(&keys::descriptor_key(TABLE_ID)) else {
            continue;
        };
        let Ok(Descriptor::Table(table)) = Descriptor::from_bytes(raw) else {
            continue;
        };
        if table.dropped() {
            return;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_a_table_releases_unused_leases_and_refuses_new_ones() {
    let (knobs, _rx) = refresh_knobs();
    let cluster = TestCluster::single(LeaseManagerConfig::default(), knobs);
    cluster.start_refresh(0);
    create_table(&cluster.db, &cluster.clock, TABLE_ID, "t1").await;

    // Populate the cache, then stop using the lease.
    let (desc, _) = acquire(cluster.manager(0), &cluster.db, TABLE_ID, 0)
        .await
        .expect("acquire");
    cluster.manager(0).release(&desc).await.expect("release");
    assert_eq!(lease_rows(&cluster.db).await.len(), 1);

    cluster
        .manager(0)
        .publish(
            TABLE_ID,
            |desc| {
                desc.state = DescriptorState::Drop;
                Ok(())
            },
            None,
        )
        .await
        .expect("publish drop");

    // The refresh worker hears the drop and releases the unused lease.
    wait_for("lease rows to drain after drop", || async {
        lease_rows(&cluster.db).await.is_empty()
    })
    .await;

    let err = acquire(cluster.manager(0), &cluster.db, TABLE_ID, 0)
        .await
        .expect_err("acquire on dropped table");
    assert!(err.is::<TableDroppedError>());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_use_leases_on_a_dropped_table_drain_on_dereference() {
    let (knobs, mut refreshed) = refresh_knobs();
    let cluster = TestCluster::single(LeaseManagerConfig::default(), knobs);
    cluster.start_refresh(0);
    create_table(&cluster.db, &cluster.clock, TABLE_ID, "t1").await;

    let (held, _) = acquire(cluster.manager(0), &cluster.db, TABLE_ID, 0)
        .await
        .expect("acquire");

    cluster
        .manager(0)
        .publish(
            TABLE_ID,
            |desc| {
                desc.state = DescriptorState::Drop;
                Ok(())
            },
            None,
        )
        .await
        .expect("publish drop");
    wait_for_drop_refresh(&mut refreshed).await;

    // The purge left the in-use lease alone.
    assert_eq!(lease_rows(&cluster.db).await.len(), 1);

    // The final dereference releases it eagerly.
    cluster.manager(0).release(&held).await.expect("release");
    wait_for("held lease row to drain", || async {
        lease_rows(&cluster.db).await.is_empty()
    })
    .await;
    cluster.shutdown().await;
}
