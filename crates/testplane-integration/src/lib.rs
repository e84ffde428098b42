//! IntegrationTest reconciliation for testplane
//!
//! An IntegrationTest runs rounds of steps. Each step applies or deletes a
//! resource, waits for it to converge, gates on an optional ReadyCondition
//! and polls expectations until they pass or the step deadline elapses.

pub mod controller;
mod rounds;
mod steps;

pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, IntegrationTestClient,
    IntegrationTestClientImpl,
};

pub use testplane_common::{Error, Result};
