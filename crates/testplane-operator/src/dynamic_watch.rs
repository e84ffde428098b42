//! Informer-backed [`TargetWatcher`]
//!
//! Tests that wait on step resources are marked active. For every kind a
//! step touches, one watcher stream is started per process; each event on
//! that stream is mapped back to its owning IntegrationTest through owner
//! references and, if that test is active, a reconcile trigger is sent.
//!
//! Triggers are advisory. A full channel drops the trigger and the regular
//! requeue picks the change up instead.

use std::sync::Arc;

use dashmap::DashSet;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace, warn};

use testplane_common::crd::IntegrationTest;
use testplane_common::kube_utils::build_api_resource;
use testplane_common::TargetWatcher;

/// Default capacity of the trigger channel
pub const DEFAULT_TRIGGER_CAPACITY: usize = 1024;

type TestKey = (String, String);

/// Shared between the manager and its watcher tasks
struct Shared {
    active: DashSet<TestKey>,
    trigger: mpsc::Sender<ObjectRef<IntegrationTest>>,
}

impl Shared {
    /// Send a reconcile trigger for the test owning `obj`, if it is active
    fn notify(&self, obj: &DynamicObject) -> bool {
        let Some((namespace, name)) = owning_test(obj) else {
            return false;
        };
        if !self.active.contains(&(namespace.clone(), name.clone())) {
            trace!(%namespace, %name, "owner is not waiting, ignoring change");
            return false;
        }
        let target = ObjectRef::<IntegrationTest>::new(&name).within(&namespace);
        match self.trigger.try_send(target) {
            Ok(()) => {
                debug!(%namespace, %name, object = %obj.name_any(), "triggered reconcile");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%namespace, %name, "trigger channel full, relying on requeue");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("trigger channel closed");
                false
            }
        }
    }
}

/// Identity of the IntegrationTest owning `obj`, from its owner references
pub fn owning_test(obj: &DynamicObject) -> Option<TestKey> {
    let namespace = obj.namespace()?;
    let api_version = IntegrationTest::api_version(&());
    let kind = IntegrationTest::kind(&());
    obj.owner_references()
        .iter()
        .find(|o| o.kind == kind && o.api_version == api_version)
        .map(|o| (namespace, o.name.clone()))
}

/// Starts informers on demand and turns their events into test reconciles
pub struct DynamicWatchManager {
    client: Option<Client>,
    shared: Arc<Shared>,
    watched: DashSet<(String, String)>,
}

impl DynamicWatchManager {
    /// Create the manager and the trigger stream to feed to the controller
    pub fn new(
        client: Client,
        capacity: usize,
    ) -> (Self, ReceiverStream<ObjectRef<IntegrationTest>>) {
        Self::build(Some(client), capacity)
    }

    fn build(
        client: Option<Client>,
        capacity: usize,
    ) -> (Self, ReceiverStream<ObjectRef<IntegrationTest>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let manager = Self {
            client,
            shared: Arc::new(Shared {
                active: DashSet::new(),
                trigger: tx,
            }),
            watched: DashSet::new(),
        };
        (manager, ReceiverStream::new(rx))
    }

    /// Number of kinds with a running watcher
    pub fn watched_kinds(&self) -> usize {
        self.watched.len()
    }

    fn spawn_watcher(&self, client: Client, api_version: &str, kind: &str) {
        let resource = build_api_resource(api_version, kind);
        let api: Api<DynamicObject> = Api::all_with(client, &resource);
        let shared = Arc::clone(&self.shared);
        let label = format!("{api_version}/{kind}");

        tokio::spawn(async move {
            info!(kind = %label, "starting dynamic watch");
            let mut events = watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed();
            while let Some(event) = events.next().await {
                match event {
                    Ok(watcher::Event::Apply(obj))
                    | Ok(watcher::Event::InitApply(obj))
                    | Ok(watcher::Event::Delete(obj)) => {
                        shared.notify(&obj);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(kind = %label, error = %e, "dynamic watch error"),
                }
            }
            info!(kind = %label, "dynamic watch ended");
        });
    }
}

impl TargetWatcher for DynamicWatchManager {
    fn activate(&self, namespace: &str, name: &str) {
        self.shared
            .active
            .insert((namespace.to_string(), name.to_string()));
    }

    fn deactivate(&self, namespace: &str, name: &str) {
        self.shared
            .active
            .remove(&(namespace.to_string(), name.to_string()));
    }

    fn watch_kind(&self, api_version: &str, kind: &str) {
        if !self
            .watched
            .insert((api_version.to_string(), kind.to_string()))
        {
            return;
        }
        match &self.client {
            Some(client) => self.spawn_watcher(client.clone(), api_version, kind),
            None => debug!(api_version, kind, "no client, watch recorded only"),
        }
    }
}
