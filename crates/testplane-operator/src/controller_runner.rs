//! Controller runner - builds controller futures for each test kind
//!
//! Each `build_*` function returns a boxed future that the caller composes.
//! Both controllers share one cluster client and one assertion evaluator.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use testplane_assert::{register_builtins, Evaluator, FunctionRegistry, HttpWebhookClient};
use testplane_common::crd::{IntegrationTest, LoadTest};
use testplane_common::{
    KubeEventPublisher, INTEGRATION_TEST_FIELD_OWNER, LOAD_TEST_FIELD_OWNER,
};
use testplane_integration::{
    error_policy as integration_error_policy, reconcile as integration_reconcile,
    Context as IntegrationContext,
};
use testplane_load::{
    error_policy as load_error_policy, reconcile as load_reconcile, Context as LoadContext,
};
use testplane_resource::{ClusterClient, KubeClusterClient};

use crate::config::Config;
use crate::dynamic_watch::DynamicWatchManager;

/// Server-side watch timeout in seconds. Kept under the client's 30s read
/// timeout so idle watches are closed by the API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be polled
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Collaborators shared by both controllers
pub struct Shared {
    client: Client,
    cluster: Arc<dyn ClusterClient>,
    evaluator: Evaluator,
}

impl Shared {
    /// Build the shared cluster client and an evaluator with the built-in catalog
    pub fn new(client: Client, config: &Config) -> anyhow::Result<Self> {
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry);
        tracing::info!(functions = registry.names().count(), "assertion functions registered");

        let webhook = HttpWebhookClient::new(config.webhook_timeout())
            .map_err(|e| anyhow::anyhow!("failed to create webhook client: {}", e))?;
        Ok(Self {
            cluster: Arc::new(KubeClusterClient::new(client.clone())),
            evaluator: Evaluator::new(Arc::new(registry), Arc::new(webhook)),
            client,
        })
    }
}

/// Build the IntegrationTest controller, driven by its own watch and the
/// dynamic-watch triggers
pub fn build_integration_controller(shared: &Shared, config: &Config) -> ControllerFuture {
    let (watches, triggers) =
        DynamicWatchManager::new(shared.client.clone(), config.watch_channel_capacity);
    let ctx = Arc::new(
        IntegrationContext::builder(
            Arc::new(testplane_integration::IntegrationTestClientImpl::new(
                shared.client.clone(),
            )),
            shared.cluster.clone(),
            shared.evaluator.clone(),
        )
        .events(Arc::new(KubeEventPublisher::new(
            shared.client.clone(),
            INTEGRATION_TEST_FIELD_OWNER,
        )))
        .watcher(Arc::new(watches))
        .build(),
    );
    let tests: Api<IntegrationTest> = Api::all(shared.client.clone());

    tracing::info!("- IntegrationTest controller");

    Box::pin(
        Controller::new(tests, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .reconcile_on(triggers)
            .shutdown_on_signal()
            .run(integration_reconcile, integration_error_policy, ctx)
            .for_each(log_reconcile_result("IntegrationTest")),
    )
}

/// Build the LoadTest controller
pub fn build_load_controller(shared: &Shared) -> ControllerFuture {
    let ctx = Arc::new(
        LoadContext::builder(
            Arc::new(testplane_load::LoadTestClientImpl::new(shared.client.clone())),
            shared.cluster.clone(),
            shared.evaluator.clone(),
        )
        .events(Arc::new(KubeEventPublisher::new(
            shared.client.clone(),
            LOAD_TEST_FIELD_OWNER,
        )))
        .build(),
    );
    let load_tests: Api<LoadTest> = Api::all(shared.client.clone());

    tracing::info!("- LoadTest controller");

    Box::pin(
        Controller::new(load_tests, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(load_reconcile, load_error_policy, ctx)
            .for_each(log_reconcile_result("LoadTest")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
