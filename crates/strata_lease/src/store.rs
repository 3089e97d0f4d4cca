//! Durable lease operations and descriptor publication.
//!
//! The store is a stateless facade over the transactional KV client and
//! the `system.lease` table. Rows are keyed by the full
//! `(descriptor, version, node, expiration)` tuple, so inserts and
//! deletes are idempotent and rows from different nodes never contend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::future::BoxFuture;
use rand::Rng;

use strata_base::hlc::Clock;
use strata_base::node::NodeIdContainer;
use strata_base::retry;
use strata_base::stop::Stopper;
use strata_kv::{keys, Db, RetryableTxnError, Txn};

use crate::descriptor::{self, Descriptor, DescriptorId, DescriptorVersion, TableDescriptor};
use crate::errors::{DescriptorNotFoundError, DidntUpdateDescriptorError, LeaseVersionChangedError};
use crate::knobs::LeaseStoreTestingKnobs;
use crate::state::TableVersionState;
use crate::LeaseManagerConfig;

/// Event-log closure run inside a publish transaction, after the
/// descriptor write.
pub type LogEventFn = dyn for<'a> Fn(&'a Txn) -> BoxFuture<'a, Result<()>> + Send + Sync;

#[derive(Clone)]
pub(crate) struct LeaseStore {
    db: Arc<Db>,
    clock: Arc<Clock>,
    node_id: Arc<NodeIdContainer>,
    config: LeaseManagerConfig,
    knobs: LeaseStoreTestingKnobs,
}

impl LeaseStore {
    pub(crate) fn new(
        db: Arc<Db>,
        clock: Arc<Clock>,
        node_id: Arc<NodeIdContainer>,
        config: LeaseManagerConfig,
        knobs: LeaseStoreTestingKnobs,
    ) -> LeaseStore {
        LeaseStore {
            db,
            clock,
            node_id,
            config,
            knobs,
        }
    }

    pub(crate) fn testing_knobs(&self) -> &LeaseStoreTestingKnobs {
        &self.knobs
    }

    /// A random duration in `[0.75, 1.25] * lease_duration`, so leases
    /// taken together do not all expire together.
    fn jittered_lease_duration(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        self.config.lease_duration.mul_f64(jitter)
    }

    fn node_id_or_die(&self) -> u64 {
        let node_id = self.node_id.get();
        if node_id == 0 {
            panic!("zero node id");
        }
        node_id
    }

    /// Acquires a lease on the most recent version of the table
    /// descriptor, or fails with `TableDroppedError` if the descriptor is
    /// being dropped. `min_expiration_micros`, when set, is a lower bound
    /// on the new lease's expiration.
    pub(crate) async fn acquire(
        &self,
        txn: &Txn,
        table_id: DescriptorId,
        min_version: DescriptorVersion,
        min_expiration_micros: Option<i64>,
    ) -> Result<Arc<TableVersionState>> {
        let now_micros = self.clock.now().wall_micros();
        let mut expiration_micros =
            now_micros + self.jittered_lease_duration().as_micros() as i64;
        if let Some(min) = min_expiration_micros {
            if expiration_micros < min {
                expiration_micros = min;
            }
        }

        // The descriptor is read under the caller's transaction so that
        // descriptors created within that transaction are visible.
        let mut table_desc = descriptor::table_desc_from_id(txn, table_id).await?;
        descriptor::filter_table_state(&table_desc)?;
        table_desc.maybe_upgrade_format_version();
        table_desc.validate_table()?;
        if table_desc.version < min_version {
            bail!("version {min_version} of table {table_id} does not exist yet");
        }
        let table = TableVersionState::new(table_desc, expiration_micros);

        // The lease row goes in its own transaction. The caller's txn may
        // abort, and the in-memory maps cannot tolerate the row being
        // reverted; if the caller never commits, the orphaned row is
        // harmless and is eventually garbage collected.
        let key = keys::lease_row_key(
            table.id(),
            table.version(),
            self.node_id_or_die(),
            expiration_micros,
        );
        self.db
            .run_txn(|txn: &Txn| {
                let key = key.clone();
                Box::pin(async move {
                    txn.put(key, Vec::new());
                    Ok(())
                })
            })
            .await
            .context("inserting lease row")?;
        Ok(table)
    }

    /// Deletes the lease row for `table`. Idempotent; retried with backoff
    /// until it succeeds or the stopper starts quiescing.
    pub(crate) async fn release(&self, stopper: &Stopper, table: &Arc<TableVersionState>) {
        let opts = retry::Options {
            closer: Some(stopper.should_quiesce()),
            ..retry::Options::default()
        };
        let mut first_attempt = true;
        let mut attempts = retry::start(opts);
        while attempts.next().await {
            let key = keys::lease_row_key(
                table.id(),
                table.version(),
                self.node_id_or_die(),
                table.expiration_micros(),
            );
            tracing::debug!(lease = %table, "lease store releasing lease");
            let result = self
                .db
                .run_txn(|txn: &Txn| {
                    let key = key.clone();
                    Box::pin(async move {
                        let existed = txn.get(&key).await?.is_some();
                        txn.delete(key);
                        Ok(existed)
                    })
                })
                .await;
            match result {
                Ok(existed) => {
                    // A previous attempt may have deleted the row and then
                    // failed to report back; only the first attempt
                    // expects to find it.
                    if !existed && first_attempt {
                        tracing::warn!(
                            lease = %table,
                            "unexpected results while deleting lease: expected 1 row, found 0"
                        );
                    }
                    if let Some(event) = &self.knobs.lease_released_event {
                        event(table.descriptor(), None);
                    }
                    return;
                }
                Err(err) => {
                    if let Some(event) = &self.knobs.lease_released_event {
                        event(table.descriptor(), Some(&err));
                    }
                    tracing::warn!(lease = %table, error = %err, "error releasing lease");
                    first_attempt = false;
                }
            }
        }
    }

    /// Number of unexpired lease rows for `(desc_id, version)`.
    pub(crate) async fn count_leases(
        &self,
        desc_id: DescriptorId,
        version: DescriptorVersion,
        now_micros: i64,
    ) -> Result<usize> {
        let prefix = keys::lease_version_prefix(desc_id, version);
        self.db
            .run_txn(|txn: &Txn| {
                let prefix = prefix.clone();
                Box::pin(async move {
                    let rows = txn.scan_prefix(&prefix).await?;
                    let mut count = 0;
                    for (key, _) in rows {
                        let row = keys::decode_lease_row_key(&key)?;
                        if row.expiration_micros > now_micros {
                            count += 1;
                        }
                    }
                    Ok(count)
                })
            })
            .await
    }

    /// Returns once no unexpired leases remain on the version before the
    /// current one, and with it the current version. From then on only
    /// versions >= the returned one can be leased: acquisition never
    /// grants a lease below the newest version it observes.
    pub(crate) async fn wait_for_one_version(
        &self,
        table_id: DescriptorId,
        retry_opts: retry::Options,
    ) -> Result<DescriptorVersion> {
        let desc_key = keys::descriptor_key(table_id);
        let mut attempts = retry::start(retry_opts);
        while attempts.next().await {
            // Read the current descriptor non-transactionally.
            let raw = self
                .db
                .get(&desc_key)
                .await?
                .ok_or_else(|| anyhow!(DescriptorNotFoundError))?;
            let table_desc = Descriptor::from_bytes(&raw)?
                .into_table()
                .ok_or_else(|| anyhow!("descriptor {table_id} is not a table"))?;
            let previous = table_desc.version - 1;
            let now_micros = self.clock.now().wall_micros();
            let count = self.count_leases(table_desc.id, previous, now_micros).await?;
            if count == 0 {
                return Ok(table_desc.version);
            }
            tracing::info!(
                desc_id = table_desc.id,
                name = %table_desc.name,
                version = previous,
                count,
                "publish (count leases)"
            );
        }
        bail!("waiting for one version of table {table_id}: retry budget exhausted")
    }

    /// Publishes a new version of the descriptor, first waiting until at
    /// most one version is live in the cluster. `update` mutates the
    /// descriptor in place and must not change its version; it may run
    /// several times and must be side-effect free. Returning
    /// `DidntUpdateDescriptorError` from `update` reports success without
    /// writing anything.
    pub(crate) async fn publish(
        &self,
        table_id: DescriptorId,
        update: &mut (dyn FnMut(&mut TableDescriptor) -> Result<()> + Send),
        log_event: Option<&LogEventFn>,
    ) -> Result<TableDescriptor> {
        let mut attempts = retry::start(retry::Options::default());
        while attempts.next().await {
            // Wait until there are no unexpired leases on the previous
            // version of the table.
            let expected_version = self
                .wait_for_one_version(table_id, retry::Options::default())
                .await?;

            // One publish transaction, retried on write conflicts.
            let mut txn_attempts = retry::start(retry::Options {
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(200),
                ..retry::Options::default()
            });
            let result = loop {
                if !txn_attempts.next().await {
                    break Err(anyhow!("publish transaction retry budget exhausted"));
                }
                let txn = self.db.new_txn();
                match self
                    .publish_attempt(&txn, table_id, expected_version, &mut *update, log_event)
                    .await
                {
                    Err(err) if err.is::<RetryableTxnError>() => continue,
                    outcome => break outcome,
                }
            };

            match result {
                Ok(desc) => return Ok(desc),
                Err(err) if err.is::<LeaseVersionChangedError>() => {
                    // Loop around and wait again.
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("publish retry loop has no retry bound")
    }

    async fn publish_attempt(
        &self,
        txn: &Txn,
        table_id: DescriptorId,
        expected_version: DescriptorVersion,
        update: &mut (dyn FnMut(&mut TableDescriptor) -> Result<()> + Send),
        log_event: Option<&LogEventFn>,
    ) -> Result<TableDescriptor> {
        // Re-read the descriptor, this time transactionally.
        let mut table_desc = descriptor::table_desc_from_id(txn, table_id).await?;
        if table_desc.version != expected_version {
            // The version changed out from under us; someone else is
            // running a schema change.
            tracing::debug!(
                expected = expected_version,
                actual = table_desc.version,
                "publish: version changed"
            );
            return Err(anyhow!(LeaseVersionChangedError));
        }

        let as_read = table_desc.clone();
        match update(&mut table_desc) {
            Ok(()) => {}
            Err(err) if err.is::<DidntUpdateDescriptorError>() => return Ok(as_read),
            Err(err) => return Err(err),
        }
        if table_desc.version != expected_version {
            bail!(
                "update closure changed the version to {}, expected {}",
                table_desc.version,
                expected_version
            );
        }

        table_desc.version += 1;
        table_desc.modification_time = self.clock.now();
        table_desc.validate_table()?;
        tracing::info!(
            desc_id = table_desc.id,
            name = %table_desc.name,
            version = table_desc.version,
            mtime = %table_desc.modification_time,
            "publish"
        );

        txn.set_system_config_trigger();
        let mut batch = txn.new_batch();
        batch.put(
            keys::descriptor_key(table_id),
            Descriptor::Table(table_desc.clone()).to_bytes()?,
        );
        if let Some(log_event) = log_event {
            // The descriptor write must be the first operation in the
            // transaction so the system-config change gossips at commit.
            txn.run(batch).await?;
            log_event(txn).await?;
            txn.commit().await?;
        } else {
            txn.commit_in_batch(batch).await?;
        }
        Ok(table_desc)
    }
}
