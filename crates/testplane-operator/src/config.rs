//! Command-line configuration
//!
//! Every flag except `--crd` and `--watch-channel-capacity` falls back to an
//! environment variable so the Deployment can configure the operator without
//! overriding its arguments.

use std::time::Duration;

use clap::Parser;

use testplane_common::telemetry::LogFormat;
use testplane_common::TESTPLANE_SYSTEM_NAMESPACE;

use crate::dynamic_watch::DEFAULT_TRIGGER_CAPACITY;

/// testplane - declarative integration and load tests for Kubernetes
#[derive(Parser, Debug, Clone)]
#[command(name = "testplane-operator", version, about, long_about = None)]
pub struct Config {
    /// Print both CRDs as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Server-side apply the CRDs on startup
    #[arg(
        long,
        env = "TESTPLANE_INSTALL_CRDS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub install_crds: bool,

    /// Only run controllers while holding the leader Lease
    #[arg(
        long,
        env = "TESTPLANE_LEADER_ELECT",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub leader_elect: bool,

    /// Namespace of the leader Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = TESTPLANE_SYSTEM_NAMESPACE)]
    pub lease_namespace: String,

    /// Lease holder identity (defaults to the hostname)
    #[arg(long, env = "POD_NAME")]
    pub identity: Option<String>,

    /// Port serving /healthz and /readyz
    #[arg(long, env = "TESTPLANE_HEALTH_PORT", default_value_t = 8081)]
    pub health_port: u16,

    /// Log output format: json or text
    #[arg(long, env = "TESTPLANE_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Per-call timeout for webhook assertions, in seconds
    #[arg(long, env = "TESTPLANE_WEBHOOK_TIMEOUT", default_value_t = 10)]
    pub webhook_timeout_secs: u64,

    /// Capacity of the dynamic-watch trigger channel
    #[arg(long, default_value_t = DEFAULT_TRIGGER_CAPACITY)]
    pub watch_channel_capacity: usize,
}

impl Config {
    /// Lease holder identity, falling back to the hostname
    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "testplane-operator".to_string())
    }

    /// Webhook per-call timeout
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}
