use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use ws_orchestrator::cluster::ClusterApi;
use ws_orchestrator::{KubeCluster, StateStore};
use ws_ports::{ExposerConfig, PortExposer};

#[derive(Parser)]
#[command(name = "ws-port-exposer")]
#[command(about = "Publishes routes for ports opened inside a workspace")]
#[command(version)]
pub struct Args {
    /// Namespace of the workspace this sidecar belongs to
    #[arg(long, env = "WORKSPACE_NAMESPACE")]
    namespace: String,

    /// Base domain routes are published under
    #[arg(long, env = "WS_DOMAIN")]
    domain: String,

    /// Workspace subdomain; read from the workspace descriptor when omitted
    #[arg(long, env = "WS_SUBDOMAIN")]
    subdomain: Option<String>,

    #[arg(long, env = "WS_SYSTEM_NAMESPACE", default_value = "workspace-system")]
    system_namespace: String,

    /// Wildcard certificate secret copied into the workspace namespace
    #[arg(long, env = "WS_TLS_SECRET", default_value = "workspace-domain-wildcard-tls")]
    tls_secret: String,

    /// Pod to probe; defaults to the primary workspace pod
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Seconds between discovery passes
    #[arg(long, env = "WS_POLL_INTERVAL", default_value_t = 30)]
    poll_interval: u64,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Only probe through the pod exec API
    #[arg(long)]
    no_local_fallback: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = ws_logging::init_subscriber();
    let args = Args::parse();

    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubeCluster::try_default("ws-port-exposer")
            .await
            .context("Failed to connect to the cluster")?,
    );

    let subdomain = match args.subdomain {
        Some(subdomain) => subdomain,
        None => StateStore::new(cluster.clone())
            .descriptor(&args.namespace)
            .await?
            .map(|d| d.subdomain)
            .with_context(|| format!("No workspace descriptor in {}", args.namespace))?,
    };

    let config = ExposerConfig {
        namespace: args.namespace,
        subdomain,
        domain: args.domain,
        system_namespace: args.system_namespace,
        tls_secret: args.tls_secret,
        pod_name: args.pod_name,
        poll_interval: Duration::from_secs(args.poll_interval.max(1)),
        local_fallback: !args.no_local_fallback,
    };
    let exposer = PortExposer::new(cluster, config);

    if args.once {
        let report = exposer.poll_once().await;
        info!(
            discovered = ?report.discovered,
            exposed = ?report.exposed,
            failed = ?report.failed,
            "single pass complete"
        );
        return Ok(());
    }

    exposer.run().await;
    Ok(())
}
