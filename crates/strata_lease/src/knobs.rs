//! Testing knobs for the lease manager and lease store.

use std::sync::Arc;

use strata_kv::SystemConfig;

use crate::descriptor::{DescriptorId, TableDescriptor};

pub type LeaseReleasedEvent = dyn Fn(&TableDescriptor, Option<&anyhow::Error>) + Send + Sync;
pub type LeaseAcquiringEvent = dyn Fn(DescriptorId) + Send + Sync;
pub type LeaseAcquiredEvent = dyn Fn(&TableDescriptor) + Send + Sync;
pub type SystemConfigEvent = dyn Fn(&SystemConfig) + Send + Sync;

#[derive(Clone, Default)]
pub struct LeaseStoreTestingKnobs {
    /// Called after each store release attempt, with the attempt error if
    /// there was one.
    pub lease_released_event: Option<Arc<LeaseReleasedEvent>>,
    /// Called just before a lease acquisition hits the store.
    pub lease_acquiring_event: Option<Arc<LeaseAcquiringEvent>>,
    /// Called after a lease is acquired.
    pub lease_acquired_event: Option<Arc<LeaseAcquiredEvent>>,
    /// Allow handing out expired leases.
    pub can_use_expired_leases: bool,
    /// Remove leases from the store as soon as their refcount drops to 0.
    pub remove_once_dereferenced: bool,
}

#[derive(Clone, Default)]
pub struct LeaseManagerTestingKnobs {
    /// Called when a gossip update is received, before leases refresh.
    /// Blocking here blocks the refresh worker.
    pub gossip_update_event: Option<Arc<SystemConfigEvent>>,
    /// Called after leases have been refreshed from a gossip update.
    pub leases_refreshed_event: Option<Arc<SystemConfigEvent>>,
    pub lease_store: LeaseStoreTestingKnobs,
}
