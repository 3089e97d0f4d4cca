//! System keyspace encodings.
//!
//! Every system table lives under a single-byte prefix followed by
//! big-endian components, so lexicographic key order matches logical order
//! and prefix scans cover exactly one table or one row group.

use anyhow::{bail, Result};

/// Descriptor metadata: `0x01 | descriptor_id`.
pub const DESCRIPTOR_PREFIX: u8 = 0x01;
/// Name index: `0x02 | database_id | normalized name`.
pub const NAME_INDEX_PREFIX: u8 = 0x02;
/// `system.lease` rows: `0x03 | desc_id | version | node_id | expiration`.
/// The full tuple is the primary key.
pub const LEASE_TABLE_PREFIX: u8 = 0x03;
/// Exclusive upper bound of the span captured in system-config snapshots.
pub const SYSTEM_SPAN_END: u8 = 0x10;

pub fn descriptor_key(id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(DESCRIPTOR_PREFIX);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub fn descriptor_prefix() -> Vec<u8> {
    vec![DESCRIPTOR_PREFIX]
}

/// Decodes the descriptor id out of a descriptor metadata key.
pub fn decode_descriptor_key(key: &[u8]) -> Result<u64> {
    if key.len() != 9 || key[0] != DESCRIPTOR_PREFIX {
        bail!("malformed descriptor key: {key:?}");
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&key[1..9]);
    Ok(u64::from_be_bytes(id))
}

pub fn name_index_key(db_id: u64, normalized_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + normalized_name.len());
    key.push(NAME_INDEX_PREFIX);
    key.extend_from_slice(&db_id.to_be_bytes());
    key.extend_from_slice(normalized_name.as_bytes());
    key
}

pub fn lease_row_key(desc_id: u64, version: u64, node_id: u64, expiration_micros: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(LEASE_TABLE_PREFIX);
    key.extend_from_slice(&desc_id.to_be_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key.extend_from_slice(&node_id.to_be_bytes());
    key.extend_from_slice(&expiration_micros.to_be_bytes());
    key
}

/// Prefix covering every lease row for one `(descriptor, version)` pair.
pub fn lease_version_prefix(desc_id: u64, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(LEASE_TABLE_PREFIX);
    key.extend_from_slice(&desc_id.to_be_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Prefix covering the whole `system.lease` table.
pub fn lease_table_prefix() -> Vec<u8> {
    vec![LEASE_TABLE_PREFIX]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseRowKey {
    pub desc_id: u64,
    pub version: u64,
    pub node_id: u64,
    pub expiration_micros: i64,
}

pub fn decode_lease_row_key(key: &[u8]) -> Result<LeaseRowKey> {
    if key.len() != 33 || key[0] != LEASE_TABLE_PREFIX {
        bail!("malformed lease row key: {key:?}");
    }
    let mut chunk = [0u8; 8];
    chunk.copy_from_slice(&key[1..9]);
    let desc_id = u64::from_be_bytes(chunk);
    chunk.copy_from_slice(&key[9..17]);
    let version = u64::from_be_bytes(chunk);
    chunk.copy_from_slice(&key[17..25]);
    let node_id = u64::from_be_bytes(chunk);
    chunk.copy_from_slice(&key[25..33]);
    let expiration_micros = i64::from_be_bytes(chunk);
    Ok(LeaseRowKey {
        desc_id,
        version,
        node_id,
        expiration_micros,
    })
}

/// Smallest key strictly greater than every key with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: scan to the end of the keyspace.
    vec![u8::MAX; prefix.len() + 1]
}

/// The span captured in system-config snapshots.
pub fn system_span() -> (Vec<u8>, Vec<u8>) {
    (vec![0x00], vec![SYSTEM_SPAN_END])
}
