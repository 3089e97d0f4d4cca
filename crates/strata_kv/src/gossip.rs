//! System-config snapshots and change notification.
//!
//! A committed transaction that set its system-config trigger publishes a
//! fresh snapshot of the system span here. Notifications collapse: the
//! watch channel only tells subscribers "something changed", and they
//! re-read the latest snapshot.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Sorted `(key, value)` snapshot of the system span.
#[derive(Clone, Debug, Default)]
pub struct SystemConfig {
    pub values: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SystemConfig {
    /// Value for `key`, if present in the snapshot.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.values
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| self.values[i].1.as_slice())
    }
}

pub struct Gossip {
    config: Mutex<Arc<SystemConfig>>,
    generation: watch::Sender<u64>,
}

impl Default for Gossip {
    fn default() -> Gossip {
        Gossip::new()
    }
}

impl Gossip {
    pub fn new() -> Gossip {
        let (generation, _) = watch::channel(0);
        Gossip {
            config: Mutex::new(Arc::new(SystemConfig::default())),
            generation,
        }
    }

    /// Channel that fires whenever a new system config lands. Receivers
    /// should treat a notification as "re-read the config now".
    pub fn register_system_config_channel(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn get_system_config(&self) -> Arc<SystemConfig> {
        self.config.lock().expect("gossip config lock").clone()
    }

    pub(crate) fn broadcast_system_config(&self, config: SystemConfig) {
        *self.config.lock().expect("gossip config lock") = Arc::new(config);
        self.generation.send_modify(|generation| *generation += 1);
    }
}
