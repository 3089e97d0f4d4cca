//! Foundation crate for StrataDB.
//!
//! This crate provides the small building blocks shared by every node
//! component: hybrid-logical timestamps, supervised background tasks with
//! two-phase shutdown, bounded retry loops, and the node-id container.

pub mod hlc;
pub mod node;
pub mod retry;
pub mod stop;
