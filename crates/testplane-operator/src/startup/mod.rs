//! Startup utilities for the testplane operator

mod crds;

pub use crds::{crds_yaml, ensure_crds_installed};
