//! Common types for testplane: CRDs, errors, events and Kubernetes utilities

#![deny(missing_docs)]

pub mod clock;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod telemetry;
pub mod watch;
pub mod yaml;

pub use clock::{Clock, SystemClock};
pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use watch::{NoopTargetWatcher, TargetWatcher};

#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
#[cfg(any(test, feature = "test-util"))]
pub use events::{RecordedEvent, RecordingEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of both testplane custom resources
pub const API_GROUP: &str = "infra.testplane.io";

/// API version of both testplane custom resources
pub const API_VERSION: &str = "v1alpha1";

/// Namespace the operator runs in by default (leader election lease lives here)
pub const TESTPLANE_SYSTEM_NAMESPACE: &str = "testplane-system";

/// Finalizer placed on every IntegrationTest
pub const INTEGRATION_TEST_FINALIZER: &str = "infra.testplane.io/integrationtest-finalizer";

/// Finalizer placed on every LoadTest
pub const LOAD_TEST_FINALIZER: &str = "infra.testplane.io/loadtest-finalizer";

/// Field owner for every write made by the IntegrationTest reconciler
pub const INTEGRATION_TEST_FIELD_OWNER: &str = "integrationtest-controller";

/// Field owner for every write made by the LoadTest reconciler
pub const LOAD_TEST_FIELD_OWNER: &str = "loadtest-controller";

/// Annotation on a LoadTest holding the SHA-256 of the last applied target manifest
pub const TARGET_SPEC_HASH_ANNOTATION: &str = "infra.testplane.io/target-spec-hash";

/// Annotation on a LoadTest set to "true" once its selector target has been resolved
pub const SELECTOR_RESOLVED_ANNOTATION: &str = "infra.testplane.io/selector-resolved";

/// Prefix of the Pod template annotations carrying injected values
pub const INJECT_ANNOTATION_PREFIX: &str = "testplane.io/inject-";
