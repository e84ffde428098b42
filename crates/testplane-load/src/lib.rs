//! LoadTest reconciliation for testplane
//!
//! A LoadTest applies or selects a target, waits for it to pass its
//! ReadyCondition, injects values extracted from it into workload Pod
//! templates, applies the workload and then checks expectations against the
//! target on a fixed cadence until the failure threshold trips or the
//! configured duration elapses.

pub mod controller;
mod injection;
mod phases;
mod target;

pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, LoadTestClient, LoadTestClientImpl,
};

pub use testplane_common::{Error, Result};
