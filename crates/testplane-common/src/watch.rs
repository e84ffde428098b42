//! Dynamic watch seam
//!
//! While a test waits on a resource's readiness or expectations, changes to
//! that resource should trigger a reconcile of the test without waiting for
//! the periodic requeue. The operator binary provides the informer-backed
//! implementation; controllers only talk to this trait.

/// Registers interest in watched resource kinds on behalf of tests
pub trait TargetWatcher: Send + Sync {
    /// Mark a test as waiting on its targets
    fn activate(&self, namespace: &str, name: &str);

    /// Mark a test as no longer waiting (terminal or deleted)
    fn deactivate(&self, namespace: &str, name: &str);

    /// Ensure an informer exists for the given kind. Idempotent per process.
    fn watch_kind(&self, api_version: &str, kind: &str);
}

/// Watcher that does nothing; reconciles rely on periodic requeues
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTargetWatcher;

impl TargetWatcher for NoopTargetWatcher {
    fn activate(&self, _namespace: &str, _name: &str) {}

    fn deactivate(&self, _namespace: &str, _name: &str) {}

    fn watch_kind(&self, _api_version: &str, _kind: &str) {}
}
