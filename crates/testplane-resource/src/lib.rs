//! Resource handling for testplane reconcilers
//!
//! Test resources carry raw manifests and selectors for arbitrary cluster
//! objects. This crate turns manifests into owned, namespace-local objects,
//! applies or deletes them with Server-Side Apply, watches them converge,
//! resolves selectors and materializes injected values into Pod templates.

#![deny(missing_docs)]

pub mod client;
pub mod inject;
pub mod manager;
pub mod manifest;
pub mod selector;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{ClusterClient, KubeClusterClient};
pub use inject::{annotation_key, inject_annotations, kebab_case};
pub use manager::{Convergence, Owner, ResourceManager};
pub use manifest::{expand, expand_single, identity_of, manifest_bytes, ManifestObject};
pub use selector::SelectorEngine;

#[cfg(test)]
pub use client::MockClusterClient;
