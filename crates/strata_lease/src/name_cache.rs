//! Cache of table name -> newest known lease.
//!
//! Updated on every acquisition and release. A mapping may only be used
//! while the node holds an active lease on the id it points at; entries
//! without enough lifetime left are treated as misses.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_base::hlc::Clock;

use crate::descriptor::{name_matches_table, normalize_name, DescriptorId};
use crate::state::TableVersionState;

pub(crate) struct TableNameCache {
    tables: Mutex<HashMap<(DescriptorId, String), Arc<TableVersionState>>>,
}

impl TableNameCache {
    pub(crate) fn new() -> TableNameCache {
        TableNameCache {
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `(db_id, table_name)` to a lease with some lifetime left.
    /// The refcount is incremented before returning; the caller must
    /// release the lease.
    pub(crate) fn get(
        &self,
        db_id: DescriptorId,
        table_name: &str,
        clock: &Clock,
        min_lease_duration: Duration,
        allow_expired: bool,
    ) -> Option<Arc<TableVersionState>> {
        let key = (db_id, normalize_name(table_name));
        let table = self
            .tables
            .lock()
            .expect("name cache lock")
            .get(&key)
            .cloned()?;
        if !name_matches_table(table.descriptor(), db_id, table_name) {
            panic!(
                "out of sync entry in the name cache: cache key {}.{:?} -> {}, lease {}.{:?}",
                db_id,
                key.1,
                table.id(),
                table.descriptor().parent_id,
                table.descriptor().name,
            );
        }
        table
            .try_ref_from_name_cache(clock, min_lease_duration, allow_expired)
            .then_some(table)
    }

    /// Keeps whichever of the existing and new entry has the higher
    /// `(version, expiration)`.
    pub(crate) fn insert(&self, table: &Arc<TableVersionState>) {
        let key = (
            table.descriptor().parent_id,
            normalize_name(&table.descriptor().name),
        );
        let mut tables = self.tables.lock().expect("name cache lock");
        match tables.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(table.clone());
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                let better = table.version() > existing.version()
                    || (table.version() == existing.version()
                        && table.expiration_micros() > existing.expiration_micros());
                if better {
                    slot.insert(table.clone());
                }
            }
        }
    }

    /// No-op unless the cached pointer is exactly `table`; a newer lease
    /// may have replaced it, and that replacement must survive.
    pub(crate) fn remove(&self, table: &Arc<TableVersionState>) {
        let key = (
            table.descriptor().parent_id,
            normalize_name(&table.descriptor().name),
        );
        let mut tables = self.tables.lock().expect("name cache lock");
        if let Entry::Occupied(slot) = tables.entry(key) {
            if Arc::ptr_eq(slot.get(), table) {
                slot.remove();
            }
        }
    }
}
