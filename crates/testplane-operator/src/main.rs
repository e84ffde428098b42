//! testplane operator - declarative integration and load tests for Kubernetes

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use testplane_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use testplane_common::telemetry::{init_telemetry, TelemetryConfig};
use testplane_operator::config::Config;
use testplane_operator::controller_runner::{
    build_integration_controller, build_load_controller, Shared,
};
use testplane_operator::health::{self, Readiness};
use testplane_operator::startup::{crds_yaml, ensure_crds_installed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS client is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let config = Config::parse();

    if config.crd {
        print!("{}", crds_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "testplane-operator".to_string(),
        format: config.log_format,
    })?;

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("testplane operator starting...");

    let readiness = Readiness::default();
    let listener = health::bind(config.health_port)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind health port {}: {}", config.health_port, e))?;
    let health_readiness = readiness.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(listener, health_readiness).await {
            tracing::error!(error = %e, "health server stopped");
        }
    });

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if config.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let mut guard = if config.leader_elect {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &config.lease_namespace,
            &config.identity(),
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    let shared = Shared::new(client, &config)?;
    tracing::info!("Starting controllers:");
    let controllers = futures::future::join_all(vec![
        build_integration_controller(&shared, &config),
        build_load_controller(&shared),
    ]);
    readiness.set_ready(true);

    match guard.as_mut() {
        Some(guard) => {
            tokio::select! {
                _ = controllers => tracing::info!("controllers stopped"),
                _ = guard.lost() => {
                    readiness.set_ready(false);
                    tracing::error!("leadership lost, exiting");
                    std::process::exit(1);
                }
            }
        }
        None => {
            controllers.await;
            tracing::info!("controllers stopped");
        }
    }

    readiness.set_ready(false);
    if let Some(guard) = guard {
        if let Err(e) = guard.release_leadership().await {
            tracing::warn!(error = %e, "failed to release lease");
        }
    }

    tracing::info!("testplane operator shutting down");
    Ok(())
}
