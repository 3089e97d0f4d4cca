//! The lease manager: public API over per-table lease state, and the
//! gossip-driven refresh worker.
//!
//! Lock order, outermost first:
//! `LeaseManager.mu > TableState.mu > TableNameCache.mu >
//! TableVersionState.mu`. Taking these out of order risks deadlock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};

use strata_base::hlc::{Clock, Timestamp};
use strata_base::node::NodeIdContainer;
use strata_base::retry;
use strata_base::stop::Stopper;
use strata_kv::{keys, Db, Gossip, Txn};

use crate::descriptor::{
    name_matches_table, normalize_name, Descriptor, DescriptorId, DescriptorVersion,
    TableDescriptor,
};
use crate::errors::DescriptorNotFoundError;
use crate::knobs::{LeaseManagerTestingKnobs, LeaseStoreTestingKnobs};
use crate::name_cache::TableNameCache;
use crate::state::{TableState, TableVersionState};
use crate::store::{LeaseStore, LogEventFn};
use crate::LeaseManagerConfig;

/// Manages acquiring and releasing per-table leases, and resolves table
/// names to descriptors. A transaction may use an acquired descriptor as
/// long as `descriptor.modification_time <= txn timestamp < expiration`.
pub struct LeaseManager {
    store: LeaseStore,
    mu: Mutex<HashMap<DescriptorId, Arc<TableState>>>,
    /// Name -> lease mappings; only valid while an active lease is held
    /// on the id, which the cache itself guarantees on lookup.
    table_names: Arc<TableNameCache>,
    draining: AtomicBool,
    clock: Arc<Clock>,
    config: LeaseManagerConfig,
    testing_knobs: LeaseManagerTestingKnobs,
    stopper: Arc<Stopper>,
}

impl LeaseManager {
    pub fn new(
        node_id: Arc<NodeIdContainer>,
        db: Arc<Db>,
        clock: Arc<Clock>,
        config: LeaseManagerConfig,
        testing_knobs: LeaseManagerTestingKnobs,
        stopper: Arc<Stopper>,
    ) -> LeaseManager {
        LeaseManager {
            store: LeaseStore::new(
                db,
                clock.clone(),
                node_id,
                config,
                testing_knobs.lease_store.clone(),
            ),
            mu: Mutex::new(HashMap::new()),
            table_names: Arc::new(TableNameCache::new()),
            draining: AtomicBool::new(false),
            clock,
            config,
            testing_knobs,
            stopper,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn config(&self) -> &LeaseManagerConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &LeaseStore {
        &self.store
    }

    pub(crate) fn store_knobs(&self) -> &LeaseStoreTestingKnobs {
        self.store.testing_knobs()
    }

    /// Acquires a read lease on the most recent version of the named
    /// table. Returns the descriptor and the lease expiration; the caller
    /// must release the descriptor.
    pub async fn acquire_by_name(
        &self,
        txn: &Txn,
        db_id: DescriptorId,
        table_name: &str,
    ) -> Result<(TableDescriptor, Timestamp)> {
        if let Some(table) = self.table_names.get(
            db_id,
            table_name,
            &self.clock,
            self.config.min_lease_duration,
            self.store_knobs().can_use_expired_leases,
        ) {
            return Ok((table.descriptor().clone(), table.expiration()));
        }

        // Nothing usable in the cache: resolve the name in the database
        // and acquire a lease on the id it maps to.
        let table_id = self.resolve_name(txn, db_id, table_name).await?;
        let (desc, expiration) = self.acquire(txn, table_id, 0).await?;
        if name_matches_table(&desc, db_id, table_name) {
            return Ok((desc, expiration));
        }

        // The name resolved, but the lease carries a different name: the
        // table is mid-rename. The lease may simply be stale, so force a
        // fresh one and check again; if the name still does not match, the
        // caller asked for the table's old name.
        if let Err(err) = self.release(&desc).await {
            tracing::warn!(error = %err, "error releasing lease");
        }
        let (desc, expiration) = self.acquire_freshest_from_store(txn, table_id).await?;
        if !name_matches_table(&desc, db_id, table_name) {
            if let Err(err) = self.release(&desc).await {
                tracing::warn!(error = %err, "error releasing lease");
            }
            return Err(anyhow!(DescriptorNotFoundError));
        }
        Ok((desc, expiration))
    }

    /// Resolves a table name to a descriptor id under the caller's
    /// transaction.
    async fn resolve_name(
        &self,
        txn: &Txn,
        db_id: DescriptorId,
        table_name: &str,
    ) -> Result<DescriptorId> {
        let key = keys::name_index_key(db_id, &normalize_name(table_name));
        let raw = txn
            .get(&key)
            .await?
            .ok_or_else(|| anyhow!(DescriptorNotFoundError))?;
        if raw.len() != 8 {
            bail!("malformed name index entry for {table_name:?}");
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&raw);
        Ok(u64::from_be_bytes(id))
    }

    /// Acquires a read lease on table `table_id`, at `version` if
    /// non-zero, otherwise at the most recent version the manager knows
    /// about. The caller must release the returned descriptor.
    pub async fn acquire(
        &self,
        txn: &Txn,
        table_id: DescriptorId,
        version: DescriptorVersion,
    ) -> Result<(TableDescriptor, Timestamp)> {
        let t = self
            .find_table_state(table_id, true)
            .expect("table state created on demand");
        let table = t.acquire(txn, version, self).await?;
        if let Some(event) = &self.store_knobs().lease_acquired_event {
            event(table.descriptor());
        }
        Ok((table.descriptor().clone(), table.expiration()))
    }

    /// Acquires a lease at least as recent as the time of the call: any
    /// acquisition already in flight is waited out, then a fresh store
    /// round trip is forced.
    pub(crate) async fn acquire_freshest_from_store(
        &self,
        txn: &Txn,
        table_id: DescriptorId,
    ) -> Result<(TableDescriptor, Timestamp)> {
        let t = self
            .find_table_state(table_id, true)
            .expect("table state created on demand");
        let table = t.acquire_freshest_from_store(txn, self).await?;
        Ok((table.descriptor().clone(), table.expiration()))
    }

    /// Releases a previously acquired descriptor.
    pub async fn release(&self, desc: &TableDescriptor) -> Result<()> {
        let t = self
            .find_table_state(desc.id, false)
            .ok_or_else(|| anyhow!("table {} not found", desc.id))?;
        t.release(desc, self).await
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Draining refuses new acquisitions and releases every inactive
    /// lease immediately; active leases are released from the store as
    /// their refcounts reach zero.
    pub async fn set_draining(&self, drain: bool) {
        self.draining.store(drain, Ordering::SeqCst);
        if !drain {
            return;
        }
        let states = self
            .mu
            .lock()
            .expect("lease manager lock")
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut removed = Vec::new();
        for t in states {
            t.collect_inactive(&mut removed);
        }
        self.release_from_store(removed).await;
    }

    /// Publishes a new version of the table descriptor; see the store for
    /// the protocol. The update closure mutates the descriptor in place
    /// and must not change its version.
    pub async fn publish<F>(
        &self,
        table_id: DescriptorId,
        update: F,
        log_event: Option<&LogEventFn>,
    ) -> Result<TableDescriptor>
    where
        F: FnMut(&mut TableDescriptor) -> Result<()> + Send,
    {
        let mut update = update;
        self.store.publish(table_id, &mut update, log_event).await
    }

    /// Blocks until no unexpired leases remain on the version before the
    /// current one; returns the current version.
    pub async fn wait_for_one_version(
        &self,
        table_id: DescriptorId,
        retry_opts: retry::Options,
    ) -> Result<DescriptorVersion> {
        self.store.wait_for_one_version(table_id, retry_opts).await
    }

    /// Table states are created lazily and live for the life of the
    /// manager.
    pub(crate) fn find_table_state(
        &self,
        table_id: DescriptorId,
        create: bool,
    ) -> Option<Arc<TableState>> {
        let mut tables = self.mu.lock().expect("lease manager lock");
        if let Some(t) = tables.get(&table_id) {
            return Some(t.clone());
        }
        if !create {
            return None;
        }
        let t = Arc::new(TableState::new(table_id, self.table_names.clone()));
        tables.insert(table_id, t.clone());
        Some(t)
    }

    /// Deletes the store rows behind removed in-memory entries. While
    /// draining, deletion happens inline so shutdown can guarantee
    /// cleanup; otherwise it runs as a supervised background task.
    pub(crate) async fn release_from_store(&self, removed: Vec<Arc<TableVersionState>>) {
        for table in removed {
            if self.is_draining() {
                self.store.release(&self.stopper, &table).await;
            } else {
                let store = self.store.clone();
                let stopper = self.stopper.clone();
                let described = table.to_string();
                let task = async move {
                    store.release(&stopper, &table).await;
                };
                if let Err(err) = self.stopper.run_async_task("lease-release", task) {
                    tracing::warn!(error = %err, lease = %described, "not releasing lease");
                }
            }
        }
    }

    /// Starts the worker that refreshes leases for tables mentioned in
    /// each new system config arriving over gossip. Dropped tables are
    /// purged; tables with a new version get their old leases released
    /// and a lease on the new version prefetched.
    pub fn refresh_leases(self: &Arc<Self>, stopper: &Stopper, db: Arc<Db>, gossip: Arc<Gossip>) {
        let m = Arc::clone(self);
        let stop = stopper.should_stop();
        stopper.run_worker("lease-refresh", async move {
            let mut config_rx = gossip.register_system_config_channel();
            let desc_prefix = keys::descriptor_prefix();
            loop {
                tokio::select! {
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let config = gossip.get_system_config();
                        if let Some(event) = &m.testing_knobs.gossip_update_event {
                            event(&config);
                        }
                        tracing::debug!("received a new system config; refreshing leases");
                        for (key, value) in &config.values {
                            if !key.starts_with(&desc_prefix) {
                                continue;
                            }
                            let descriptor = match Descriptor::from_bytes(value) {
                                Ok(descriptor) => descriptor,
                                Err(err) => {
                                    tracing::warn!(key = ?key, error = %err, "unable to decode descriptor");
                                    continue;
                                }
                            };
                            match descriptor {
                                Descriptor::Table(mut table) => {
                                    table.maybe_upgrade_format_version();
                                    if let Err(err) = table.validate_table() {
                                        tracing::error!(error = %err, "received invalid table descriptor");
                                        continue;
                                    }
                                    tracing::debug!(
                                        id = table.id,
                                        name = %table.name,
                                        version = table.version,
                                        dropped = table.dropped(),
                                        "refreshing lease"
                                    );
                                    // Tables never leased on this node have
                                    // nothing to refresh.
                                    if let Some(t) = m.find_table_state(table.id, false) {
                                        if let Err(err) = t
                                            .purge_old_leases(&db, table.dropped(), table.version, &m)
                                            .await
                                        {
                                            tracing::warn!(
                                                id = table.id,
                                                name = %table.name,
                                                error = %err,
                                                "error purging leases"
                                            );
                                        }
                                    }
                                }
                                Descriptor::Database(_) => {}
                            }
                        }
                        if let Some(event) = &m.testing_knobs.leases_refreshed_event {
                            event(&config);
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
        });
    }
}
