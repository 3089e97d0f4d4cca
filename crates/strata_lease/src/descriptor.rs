//! Table and database descriptors: the versioned schema records that
//! leases are taken on.
//!
//! A descriptor is immutable once written at a given version. The lease
//! manager consults only the header fields here; column payloads ride
//! along opaquely and are validated for structural integrity on read.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use strata_base::hlc::Timestamp;
use strata_kv::{keys, Txn};

use crate::errors::{DescriptorNotFoundError, TableDroppedError};

pub type DescriptorId = u64;
pub type DescriptorVersion = u64;

/// Legacy descriptor encoding, upgraded in memory on read.
pub const FORMAT_VERSION_BASE: u32 = 1;
/// Current descriptor encoding.
pub const FORMAT_VERSION_CURRENT: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorState {
    Public,
    Drop,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub id: u32,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub id: DescriptorId,
    pub name: String,
    /// Database the table belongs to.
    pub parent_id: DescriptorId,
    pub version: DescriptorVersion,
    /// Cluster timestamp at which this version became valid.
    pub modification_time: Timestamp,
    pub format_version: u32,
    pub state: DescriptorState,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn dropped(&self) -> bool {
        self.state == DescriptorState::Drop
    }

    /// Upgrades a legacy on-disk encoding in memory. The stored bytes are
    /// left alone; the write path always emits the current format.
    pub fn maybe_upgrade_format_version(&mut self) {
        if self.format_version < FORMAT_VERSION_CURRENT {
            self.format_version = FORMAT_VERSION_CURRENT;
        }
    }

    /// Structural integrity checks applied before a descriptor is handed
    /// to anyone.
    pub fn validate_table(&self) -> Result<()> {
        if self.id == 0 {
            bail!("invalid table descriptor: id 0");
        }
        if self.name.is_empty() {
            bail!("invalid table descriptor {}: empty name", self.id);
        }
        if self.parent_id == 0 {
            bail!("invalid table descriptor {} ({}): parent id 0", self.id, self.name);
        }
        if self.version == 0 {
            bail!("invalid table descriptor {} ({}): version 0", self.id, self.name);
        }
        if self.format_version > FORMAT_VERSION_CURRENT {
            bail!(
                "table descriptor {} ({}) has format {} newer than this node understands",
                self.id,
                self.name,
                self.format_version
            );
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if column.id == 0 {
                bail!("table descriptor {} ({}): column id 0", self.id, self.name);
            }
            if column.name.is_empty() {
                bail!("table descriptor {} ({}): empty column name", self.id, self.name);
            }
            if !seen.insert(column.id) {
                bail!(
                    "table descriptor {} ({}): duplicate column id {}",
                    self.id,
                    self.name,
                    column.id
                );
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub id: DescriptorId,
    pub name: String,
}

/// Envelope stored under a descriptor metadata key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Descriptor {
    Table(TableDescriptor),
    Database(DatabaseDescriptor),
}

impl Descriptor {
    pub fn into_table(self) -> Option<TableDescriptor> {
        match self {
            Descriptor::Table(table) => Some(table),
            Descriptor::Database(_) => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("encode descriptor")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Descriptor> {
        serde_json::from_slice(raw).context("decode descriptor")
    }
}

/// Deterministic folding applied to table names before any cache or index
/// lookup. Must match the folding used when the name key was written.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
}

pub fn name_matches_table(table: &TableDescriptor, db_id: DescriptorId, name: &str) -> bool {
    table.parent_id == db_id && normalize_name(&table.name) == normalize_name(name)
}

/// Reads the table descriptor for `id` under the caller's transaction, so
/// descriptors created inside that transaction are visible.
pub async fn table_desc_from_id(txn: &Txn, id: DescriptorId) -> Result<TableDescriptor> {
    let raw = txn
        .get(&keys::descriptor_key(id))
        .await?
        .ok_or_else(|| anyhow!(DescriptorNotFoundError))?;
    match Descriptor::from_bytes(&raw)? {
        Descriptor::Table(table) => Ok(table),
        Descriptor::Database(_) => bail!("descriptor {id} is not a table"),
    }
}

/// Refuses descriptors in states that cannot be leased.
pub fn filter_table_state(table: &TableDescriptor) -> Result<()> {
    if table.dropped() {
        return Err(anyhow!(TableDroppedError));
    }
    Ok(())
}
