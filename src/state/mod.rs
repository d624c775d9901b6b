//! Persistence for project state.
//!
//! Snapshots are whole-project JSON documents. Callers treat save failures
//! as non-fatal; see [`StateStore`].

mod store;

pub use store::{JsonStateStore, MemoryStateStore, StateStore};
