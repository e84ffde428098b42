//! testplane operator: wiring for the IntegrationTest and LoadTest controllers

#![deny(missing_docs)]

/// Command-line configuration
pub mod config;
/// Controller construction
pub mod controller_runner;
/// Informer-backed reconcile triggers for waiting tests
pub mod dynamic_watch;
/// `/healthz` and `/readyz`
pub mod health;
/// Startup utilities (CRD install)
pub mod startup;
