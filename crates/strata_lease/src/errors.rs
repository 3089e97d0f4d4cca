//! Sentinel errors with semantic meaning to lease-manager callers.
//!
//! These are matched by type through `anyhow::Error::is`, so they must
//! stay free of payload and be returned without wrapping.

use std::fmt;

/// The descriptor is being dropped; no new leases can be taken on it.
/// Callers must not retry.
#[derive(Clone, Copy, Debug, Default)]
pub struct TableDroppedError;

impl fmt::Display for TableDroppedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("table is being dropped")
    }
}

impl std::error::Error for TableDroppedError {}

/// No descriptor exists for the requested name or id.
#[derive(Clone, Copy, Debug, Default)]
pub struct DescriptorNotFoundError;

impl fmt::Display for DescriptorNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("descriptor not found")
    }
}

impl std::error::Error for DescriptorNotFoundError {}

/// Returned by a publish update closure that decided not to change the
/// descriptor; publish reports success with the descriptor as read.
#[derive(Clone, Copy, Debug, Default)]
pub struct DidntUpdateDescriptorError;

impl fmt::Display for DidntUpdateDescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("did not update the descriptor")
    }
}

impl std::error::Error for DidntUpdateDescriptorError {}

/// The descriptor version moved while publish was waiting; publish loops
/// and tries again. Never surfaced to callers.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct LeaseVersionChangedError;

impl fmt::Display for LeaseVersionChangedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("lease version changed")
    }
}

impl std::error::Error for LeaseVersionChangedError {}
