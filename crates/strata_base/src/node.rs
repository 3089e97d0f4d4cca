//! Node-id container.

use std::sync::atomic::{AtomicU64, Ordering};

/// Holds the node id once it is known. Id `0` means "not set yet"; code
/// that stamps durable state with the node id must treat `0` as a bug.
#[derive(Debug, Default)]
pub struct NodeIdContainer {
    id: AtomicU64,
}

impl NodeIdContainer {
    pub fn new() -> NodeIdContainer {
        NodeIdContainer {
            id: AtomicU64::new(0),
        }
    }

    /// Sets the node id. Setting it twice to different values is a bug.
    pub fn set(&self, id: u64) {
        assert!(id != 0, "node id must be non-zero");
        let prev = self.id.swap(id, Ordering::SeqCst);
        assert!(prev == 0 || prev == id, "node id changed from {prev} to {id}");
    }

    /// Returns the node id, or 0 if it has not been set.
    pub fn get(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_reads_zero() {
        let c = NodeIdContainer::new();
        assert_eq!(c.get(), 0);
        c.set(7);
        assert_eq!(c.get(), 7);
        // Re-setting to the same value is allowed.
        c.set(7);
    }

    #[test]
    #[should_panic(expected = "node id must be non-zero")]
    fn zero_id_rejected() {
        NodeIdContainer::new().set(0);
    }
}
