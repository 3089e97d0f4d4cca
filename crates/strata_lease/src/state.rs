//! Per-table in-memory lease state.
//!
//! `TableVersionState` is one immutable descriptor snapshot with a
//! refcount; `TableSet` keeps a table's active snapshots sorted by
//! version; `TableState` serializes acquisition and release for one table
//! and enforces the single-flight discipline on store round trips.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::watch;

use strata_base::hlc::{Clock, Timestamp};
use strata_kv::{Db, Txn};

use crate::descriptor::{DescriptorId, DescriptorVersion, TableDescriptor};
use crate::errors::TableDroppedError;
use crate::manager::LeaseManager;
use crate::name_cache::TableNameCache;

struct VersionMu {
    refcount: i64,
    /// Set when the lease has been released and must not be handed out
    /// again. The name cache can still hold a pointer to such an entry
    /// because cache removal is not atomic with release.
    invalid: bool,
}

/// One `(table, version)` snapshot with a concrete expiration. The
/// descriptor is immutable and shared; only the refcount and the invalid
/// flag change, under the entry's own mutex.
pub(crate) struct TableVersionState {
    desc: TableDescriptor,
    expiration_micros: i64,
    mu: Mutex<VersionMu>,
}

impl TableVersionState {
    pub(crate) fn new(desc: TableDescriptor, expiration_micros: i64) -> Arc<TableVersionState> {
        Arc::new(TableVersionState {
            desc,
            expiration_micros,
            mu: Mutex::new(VersionMu {
                refcount: 0,
                invalid: false,
            }),
        })
    }

    pub(crate) fn descriptor(&self) -> &TableDescriptor {
        &self.desc
    }

    pub(crate) fn id(&self) -> DescriptorId {
        self.desc.id
    }

    pub(crate) fn version(&self) -> DescriptorVersion {
        self.desc.version
    }

    pub(crate) fn expiration_micros(&self) -> i64 {
        self.expiration_micros
    }

    pub(crate) fn expiration(&self) -> Timestamp {
        Timestamp::from_wall_micros(self.expiration_micros)
    }

    /// Whether the lease has at least `min` lifetime left.
    pub(crate) fn has_some_life_left(
        &self,
        clock: &Clock,
        min: Duration,
        allow_expired: bool,
    ) -> bool {
        if allow_expired {
            return true;
        }
        let min_desired_micros = clock.now().wall_micros() + min.as_micros() as i64;
        self.expiration_micros > min_desired_micros
    }

    pub(crate) fn inc_refcount(&self) {
        let mut vm = self.mu.lock().expect("table version lock");
        if vm.invalid {
            panic!(
                "trying to increment refcount on released lease: {}",
                self.describe(&vm)
            );
        }
        vm.refcount += 1;
        tracing::trace!(lease = %self.describe(&vm), "incref");
    }

    /// Decrements the refcount; returns true if the entry became invalid
    /// and must be removed from the set and the store.
    pub(crate) fn dec_refcount(&self, remove_once_dereferenced: bool) -> bool {
        let mut vm = self.mu.lock().expect("table version lock");
        vm.refcount -= 1;
        if vm.refcount < 0 {
            panic!("negative ref count: {}", self.describe(&vm));
        }
        tracing::trace!(lease = %self.describe(&vm), "release");
        if vm.refcount == 0 && remove_once_dereferenced {
            vm.invalid = true;
        }
        vm.invalid
    }

    /// Marks an unreferenced entry invalid. Returns true if it did, in
    /// which case the caller removes the entry.
    pub(crate) fn invalidate_if_unreferenced(&self) -> bool {
        let mut vm = self.mu.lock().expect("table version lock");
        if vm.refcount == 0 && !vm.invalid {
            vm.invalid = true;
            true
        } else {
            false
        }
    }

    /// Name-cache hit path: refuses invalid or nearly-expired entries,
    /// otherwise takes a reference.
    pub(crate) fn try_ref_from_name_cache(
        &self,
        clock: &Clock,
        min: Duration,
        allow_expired: bool,
    ) -> bool {
        if !self.has_some_life_left(clock, min, allow_expired) {
            return false;
        }
        let mut vm = self.mu.lock().expect("table version lock");
        if vm.invalid {
            // Raced with a release; the cache entry is about to go away.
            return false;
        }
        vm.refcount += 1;
        tracing::trace!(lease = %self.describe(&vm), "incref via name cache");
        true
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> i64 {
        self.mu.lock().expect("table version lock").refcount
    }

    fn describe(&self, vm: &VersionMu) -> String {
        format!(
            "{}({:?}) ver={}:{}, refcount={}",
            self.desc.id, self.desc.name, self.desc.version, self.expiration_micros, vm.refcount
        )
    }
}

impl fmt::Display for TableVersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vm = self.mu.lock().expect("table version lock");
        f.write_str(&self.describe(&vm))
    }
}

/// Active snapshots for one table, sorted by `(version, expiration)`.
/// Within the set versions are unique; a same-version replacement goes
/// through `TableState::upsert_locked`, never through `insert`.
#[derive(Default)]
pub(crate) struct TableSet {
    data: Vec<Arc<TableVersionState>>,
}

impl TableSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn entries(&self) -> Vec<Arc<TableVersionState>> {
        self.data.clone()
    }

    pub(crate) fn insert(&mut self, table: Arc<TableVersionState>) {
        let (i, matched) = self.find_index(table.version());
        if matched {
            panic!("unable to insert duplicate lease: {table}");
        }
        self.data.insert(i, table);
    }

    pub(crate) fn remove(&mut self, table: &Arc<TableVersionState>) {
        let (i, matched) = self.find_index(table.version());
        if !matched {
            panic!("cannot find lease to remove: {table}");
        }
        self.data.remove(i);
    }

    pub(crate) fn find(&self, version: DescriptorVersion) -> Option<Arc<TableVersionState>> {
        let (i, matched) = self.find_index(version);
        matched.then(|| self.data[i].clone())
    }

    /// For `version == 0`, the newest entry overall; otherwise the newest
    /// entry at exactly `version`.
    pub(crate) fn find_newest(&self, version: DescriptorVersion) -> Option<Arc<TableVersionState>> {
        if version == 0 {
            return self.data.last().cloned();
        }
        let i = self.data.partition_point(|s| s.version() <= version);
        if i == 0 {
            return None;
        }
        let candidate = &self.data[i - 1];
        (candidate.version() == version).then(|| candidate.clone())
    }

    fn find_index(&self, version: DescriptorVersion) -> (usize, bool) {
        let i = self.data.partition_point(|s| s.version() < version);
        let matched = self.data.get(i).is_some_and(|s| s.version() == version);
        (i, matched)
    }
}

impl fmt::Display for TableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.data.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", s.version(), s.expiration_micros())?;
        }
        Ok(())
    }
}

struct TableStateInner {
    active: TableSet,
    /// Present while a store acquisition is in flight for this table.
    /// Waiters subscribe and are woken when the sender is dropped; they
    /// re-examine the set rather than inheriting the acquirer's result.
    acquiring: Option<watch::Sender<()>>,
    /// Once set, leases are released from the store as soon as their
    /// refcount drops to zero instead of waiting for expiration.
    dropped: bool,
}

/// Per-table aggregate owning the active set. All mutations of the set and
/// of `acquiring` happen with the state mutex held; the mutex is never
/// held across a store round trip.
pub(crate) struct TableState {
    pub(crate) id: DescriptorId,
    name_cache: Arc<TableNameCache>,
    mu: Mutex<TableStateInner>,
}

/// Clears the in-flight marker if the acquiring future is dropped before
/// it can publish a result, so waiters are woken rather than wedged.
struct AcquiringGuard<'a> {
    table: &'a TableState,
    armed: bool,
}

impl Drop for AcquiringGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut inner) = self.table.mu.lock() {
                inner.acquiring = None;
            }
        }
    }
}

enum AcquireStep {
    Wait(watch::Receiver<()>),
    Acquire(Option<i64>),
}

impl TableState {
    pub(crate) fn new(id: DescriptorId, name_cache: Arc<TableNameCache>) -> TableState {
        TableState {
            id,
            name_cache,
            mu: Mutex::new(TableStateInner {
                active: TableSet::default(),
                acquiring: None,
                dropped: false,
            }),
        }
    }

    /// Returns a lease at `version` (0 = newest), refcount incremented.
    /// The caller is responsible for releasing it.
    pub(crate) async fn acquire(
        &self,
        txn: &Txn,
        version: DescriptorVersion,
        m: &LeaseManager,
    ) -> Result<Arc<TableVersionState>> {
        loop {
            let step = {
                let mut inner = self.mu.lock().expect("table state lock");
                if let Some(table) = inner.active.find_newest(version) {
                    if let Some(checked) = Self::check_table(&inner, &table, version, m) {
                        return Ok(checked);
                    }
                } else if version != 0 {
                    if let Some(newest) = inner.active.find_newest(0) {
                        if version < newest.version() {
                            bail!(
                                "table {} unable to acquire lease on old version: {} < {}",
                                self.id,
                                version,
                                newest.version()
                            );
                        }
                    }
                }
                if let Some(sender) = &inner.acquiring {
                    AcquireStep::Wait(sender.subscribe())
                } else {
                    let (sender, _) = watch::channel(());
                    inner.acquiring = Some(sender);
                    AcquireStep::Acquire(None)
                }
            };
            // A new lease may have been added by the time a waiter wakes,
            // or the one that fits may still be missing; both paths loop
            // and look again.
            self.run_acquire_step(step, txn, version, m).await?;
        }
    }

    /// Acquires a fresh lease from the store, bypassing any acquisition
    /// already in flight, and returns it with its refcount incremented.
    /// The minimum expiration bound guarantees the result sorts last in
    /// the active set.
    pub(crate) async fn acquire_freshest_from_store(
        &self,
        txn: &Txn,
        m: &LeaseManager,
    ) -> Result<Arc<TableVersionState>> {
        loop {
            let step = {
                let mut inner = self.mu.lock().expect("table state lock");
                if let Some(sender) = &inner.acquiring {
                    AcquireStep::Wait(sender.subscribe())
                } else {
                    let (sender, _) = watch::channel(());
                    inner.acquiring = Some(sender);
                    let min_expiration = inner
                        .active
                        .find_newest(0)
                        .map(|newest| newest.expiration_micros() + 1_000);
                    AcquireStep::Acquire(min_expiration)
                }
            };
            match step {
                AcquireStep::Wait(mut rx) => {
                    let _ = rx.changed().await;
                }
                AcquireStep::Acquire(min_expiration) => {
                    let mut guard = AcquiringGuard {
                        table: self,
                        armed: true,
                    };
                    let result = self.acquire_node_lease(txn, 0, m, min_expiration).await;
                    let mut removed = Vec::new();
                    let outcome = {
                        let mut inner = self.mu.lock().expect("table state lock");
                        inner.acquiring = None;
                        match result {
                            Ok(table) => {
                                self.upsert_locked(&mut inner, table, &mut removed);
                                let newest =
                                    inner.active.find_newest(0).unwrap_or_else(|| {
                                        panic!(
                                            "no lease in active set after acquiring one for table {}",
                                            self.id
                                        )
                                    });
                                newest.inc_refcount();
                                Ok(newest)
                            }
                            Err(err) => Err(err),
                        }
                    };
                    guard.armed = false;
                    m.release_from_store(removed).await;
                    return outcome;
                }
            }
        }
    }

    async fn run_acquire_step(
        &self,
        step: AcquireStep,
        txn: &Txn,
        version: DescriptorVersion,
        m: &LeaseManager,
    ) -> Result<()> {
        match step {
            AcquireStep::Wait(mut rx) => {
                let _ = rx.changed().await;
                Ok(())
            }
            AcquireStep::Acquire(min_expiration) => {
                let mut guard = AcquiringGuard {
                    table: self,
                    armed: true,
                };
                let result = self
                    .acquire_node_lease(txn, version, m, min_expiration)
                    .await;
                let mut removed = Vec::new();
                {
                    let mut inner = self.mu.lock().expect("table state lock");
                    inner.acquiring = None;
                    if let Ok(table) = &result {
                        self.upsert_locked(&mut inner, table.clone(), &mut removed);
                    }
                }
                guard.armed = false;
                m.release_from_store(removed).await;
                result.map(|_| ())
            }
        }
    }

    /// Whether `table` can be handed to a caller that asked for `version`.
    /// Increments the refcount when it can.
    fn check_table(
        inner: &TableStateInner,
        table: &Arc<TableVersionState>,
        version: DescriptorVersion,
        m: &LeaseManager,
    ) -> Option<Arc<TableVersionState>> {
        // A lease explicitly requested at an older version is handed out
        // even when close to (or past) expiration: renewing it would
        // violate the newest-only acquisition rule, and the owning
        // transaction either finishes under it or aborts.
        let newest = inner.active.find_newest(0);
        let skip_life_check =
            version != 0 && newest.as_ref().is_none_or(|n| !Arc::ptr_eq(n, table));
        if !skip_life_check
            && !table.has_some_life_left(
                m.clock(),
                m.config().min_lease_duration,
                m.store_knobs().can_use_expired_leases,
            )
        {
            return None;
        }
        table.inc_refcount();
        Some(table.clone())
    }

    /// One store round trip. Called without the state mutex held; the
    /// in-flight marker set by the caller keeps this single-flight.
    async fn acquire_node_lease(
        &self,
        txn: &Txn,
        min_version: DescriptorVersion,
        m: &LeaseManager,
        min_expiration_micros: Option<i64>,
    ) -> Result<Arc<TableVersionState>> {
        if m.is_draining() {
            bail!("cannot acquire lease when draining");
        }
        if let Some(event) = &m.store_knobs().lease_acquiring_event {
            event(self.id);
        }
        let table = m
            .store()
            .acquire(txn, self.id, min_version, min_expiration_micros)
            .await?;
        self.name_cache.insert(&table);
        Ok(table)
    }

    /// Inserts a new snapshot; an existing entry at the same version is
    /// subsumed: its refcount is taken over and it is invalidated and
    /// removed. This happens when a preemptive acquisition races a
    /// concurrent one.
    fn upsert_locked(
        &self,
        inner: &mut TableStateInner,
        table: Arc<TableVersionState>,
        removed: &mut Vec<Arc<TableVersionState>>,
    ) {
        let Some(existing) = inner.active.find(table.version()) else {
            inner.active.insert(table);
            return;
        };
        {
            let mut old = existing.mu.lock().expect("table version lock");
            let mut new = table.mu.lock().expect("table version lock");
            new.refcount += old.refcount;
            old.refcount = 0;
            old.invalid = true;
        }
        tracing::debug!(old = %existing, new = %table, "replaced lease");
        self.remove_table_locked(inner, &existing, removed);
        inner.active.insert(table);
    }

    fn remove_table_locked(
        &self,
        inner: &mut TableStateInner,
        table: &Arc<TableVersionState>,
        removed: &mut Vec<Arc<TableVersionState>>,
    ) {
        inner.active.remove(table);
        self.name_cache.remove(table);
        removed.push(table.clone());
    }

    fn release_inactive_leases_locked(
        &self,
        inner: &mut TableStateInner,
        removed: &mut Vec<Arc<TableVersionState>>,
    ) {
        for table in inner.active.entries() {
            if table.invalidate_if_unreferenced() {
                self.remove_table_locked(inner, &table, removed);
            }
        }
    }

    /// Releases unreferenced leases; used by `SetDraining`. Removed
    /// entries are returned for the caller to delete from the store.
    pub(crate) fn collect_inactive(&self, removed: &mut Vec<Arc<TableVersionState>>) {
        let mut inner = self.mu.lock().expect("table state lock");
        self.release_inactive_leases_locked(&mut inner, removed);
    }

    pub(crate) async fn release(&self, desc: &TableDescriptor, m: &LeaseManager) -> Result<()> {
        let mut removed = Vec::new();
        {
            let mut inner = self.mu.lock().expect("table state lock");
            let table = inner.active.find(desc.version).ok_or_else(|| {
                anyhow!("table {} version {} not found", desc.id, desc.version)
            })?;
            // Remove from the store once dereferenced if the table was
            // dropped, the manager is draining, or the lease is not for
            // the newest version (only newest-version leases can be
            // acquired, so an old one will never be referenced again).
            let newest = inner.active.find_newest(0);
            let remove_once_dereferenced = m.store_knobs().remove_once_dereferenced
                || inner.dropped
                || m.is_draining()
                || newest.is_none_or(|n| !Arc::ptr_eq(&n, &table));
            if table.dec_refcount(remove_once_dereferenced) {
                self.remove_table_locked(&mut inner, &table, &mut removed);
            }
        }
        m.release_from_store(removed).await;
        Ok(())
    }

    /// Refreshes the leases on this table. Unused leases older than
    /// `min_version` are released; if `dropped` is set no new lease is
    /// acquired, all unused leases are released, and in-use ones are
    /// released eagerly as they are dereferenced. A table with no active
    /// leases is left alone.
    pub(crate) async fn purge_old_leases(
        self: &Arc<Self>,
        db: &Db,
        dropped: bool,
        min_version: DescriptorVersion,
        m: &Arc<LeaseManager>,
    ) -> Result<()> {
        {
            let inner = self.mu.lock().expect("table state lock");
            if inner.active.is_empty() {
                return Ok(());
            }
        }
        if dropped {
            self.release_inactives(m, true).await;
            return Ok(());
        }
        // Pin a lease at a version >= min_version so the newest version
        // survives the release of inactive leases below.
        let result = {
            let t = Arc::clone(self);
            let m = Arc::clone(m);
            db.run_txn(move |txn: &Txn| {
                let t = t.clone();
                let m = m.clone();
                Box::pin(async move { t.acquire(txn, min_version, &m).await })
            })
            .await
        };
        match result {
            Ok(table) => {
                self.release_inactives(m, false).await;
                let desc = table.descriptor().clone();
                self.release(&desc, m).await
            }
            Err(err) if err.is::<TableDroppedError>() => {
                self.release_inactives(m, true).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn release_inactives(&self, m: &LeaseManager, drop: bool) {
        let mut removed = Vec::new();
        {
            let mut inner = self.mu.lock().expect("table state lock");
            inner.dropped = drop;
            self.release_inactive_leases_locked(&mut inner, &mut removed);
        }
        m.release_from_store(removed).await;
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ColumnDescriptor, DescriptorState, FORMAT_VERSION_CURRENT};

    fn snapshot(version: DescriptorVersion, expiration_micros: i64) -> Arc<TableVersionState> {
        TableVersionState::new(
            TableDescriptor {
                id: 50,
                name: "t".to_string(),
                parent_id: 1,
                version,
                modification_time: Timestamp::ZERO,
                format_version: FORMAT_VERSION_CURRENT,
                state: DescriptorState::Public,
                columns: vec![ColumnDescriptor {
                    id: 1,
                    name: "k".to_string(),
                }],
            },
            expiration_micros,
        )
    }

    #[test]
    fn table_set_keeps_versions_sorted() {
        let mut set = TableSet::default();
        assert!(set.find_newest(0).is_none());

        set.insert(snapshot(2, 200));
        set.insert(snapshot(1, 100));
        set.insert(snapshot(3, 150));

        assert_eq!(format!("{set}"), "1:100 2:200 3:150");
        assert_eq!(set.find(2).expect("find").version(), 2);
        assert!(set.find(4).is_none());
        assert_eq!(set.find_newest(0).expect("newest").version(), 3);
        assert_eq!(set.find_newest(1).expect("newest v1").version(), 1);
        assert!(set.find_newest(4).is_none());

        let two = set.find(2).expect("find");
        set.remove(&two);
        assert_eq!(format!("{set}"), "1:100 3:150");
    }

    #[test]
    #[should_panic(expected = "unable to insert duplicate lease")]
    fn duplicate_version_insert_panics() {
        let mut set = TableSet::default();
        set.insert(snapshot(1, 100));
        set.insert(snapshot(1, 200));
    }

    #[test]
    #[should_panic(expected = "cannot find lease to remove")]
    fn removing_missing_lease_panics() {
        let mut set = TableSet::default();
        set.remove(&snapshot(1, 100));
    }

    #[test]
    fn refcounts_track_references() {
        let s = snapshot(1, 100);
        s.inc_refcount();
        s.inc_refcount();
        assert_eq!(s.refcount(), 2);
        assert!(!s.dec_refcount(true));
        // The last dereference with removal warranted invalidates.
        assert!(s.dec_refcount(true));
        assert_eq!(s.refcount(), 0);
    }

    #[test]
    fn unreferenced_entries_invalidate_once() {
        let s = snapshot(1, 100);
        assert!(s.invalidate_if_unreferenced());
        assert!(!s.invalidate_if_unreferenced());

        let held = snapshot(2, 100);
        held.inc_refcount();
        assert!(!held.invalidate_if_unreferenced());
    }

    #[test]
    #[should_panic(expected = "trying to increment refcount on released lease")]
    fn invalid_entries_refuse_references() {
        let s = snapshot(1, 100);
        assert!(s.invalidate_if_unreferenced());
        s.inc_refcount();
    }

    #[test]
    #[should_panic(expected = "negative ref count")]
    fn negative_refcount_panics() {
        snapshot(1, 100).dec_refcount(false);
    }

    #[test]
    fn life_check_tracks_clock() {
        let source = Arc::new(strata_base::hlc::ManualTimeSource::new(0));
        let clock = Clock::new(source.clone(), Duration::from_millis(1));
        // Expires at 10ms; with a 5ms minimum it is usable only before 5ms.
        let s = snapshot(1, 10_000);
        assert!(s.has_some_life_left(&clock, Duration::from_millis(5), false));
        source.advance(Duration::from_millis(6));
        assert!(!s.has_some_life_left(&clock, Duration::from_millis(5), false));
        assert!(s.has_some_life_left(&clock, Duration::from_millis(5), true));
    }
}
