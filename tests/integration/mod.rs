//! Integration test suite for maos.
//!
//! These tests drive the public API end to end: planning task sets,
//! executing them through mock executors, and persisting the resulting
//! project state.
//!
//! # Test Categories
//!
//! - `execution`: Sequential, parallel and hybrid runs, budgets, cancellation
//! - `analyzer_props`: Property tests over randomly generated task graphs
//! - `persistence`: JSON state store and project runner round trips
//!
//! # CI Compatibility
//!
//! Executors are in-process mocks and time-dependent tests run on a paused
//! tokio clock, so nothing here touches the network or sleeps for real.

mod fixtures;

mod execution;
mod analyzer_props;
mod persistence;
