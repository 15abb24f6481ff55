//! Kong ingress controller - keeps a Kong gateway in sync with the routing
//! intent declared through Ingress and Domain resources.

use std::time::Duration;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, CustomResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kong_ingress::controller::{Config, KongController};
use kong_ingress::crd::Domain;
use kong_ingress::kong::KongClient;
use kong_ingress::version::Version;
use kong_ingress::{monitoring, startup, MINIMAL_MINOR_KONG_VERSION};

/// How often the caches replay their content as synthetic updates
const RESYNC_PERIOD: Duration = Duration::from_secs(120);

/// Kong ingress controller for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kong-ingress", about, long_about = None)]
struct Cli {
    /// Kubernetes api server addr, e.g. 'http://127.0.0.1:8080'. Omit to run
    /// in on-cluster mode using the service account token.
    #[arg(long)]
    apiserver: Option<String>,

    /// Path to the public TLS certificate file
    #[arg(long)]
    cert_file: Option<String>,

    /// Path to the private TLS certificate file
    #[arg(long)]
    key_file: Option<String>,

    /// Path to the TLS CA file
    #[arg(long)]
    ca_file: Option<String>,

    /// Don't verify the api server's CA certificate
    #[arg(long)]
    tls_insecure: bool,

    /// Kong admin api service, e.g. 'http://127.0.0.1:8001'
    #[arg(long)]
    kong_server: String,

    /// Kubernetes cluster dns name, used to configure the upstream apis in
    /// Kong
    #[arg(long, default_value = "svc.cluster.local")]
    cluster_dns: String,

    /// The namespace to store cluster primary domains. Ignored when running
    /// inside a kubernetes pod (POD_NAMESPACE wins).
    #[arg(long, default_value = kong_ingress::DEFAULT_POD_NAMESPACE)]
    pod_namespace: String,

    /// Try to claim hosts on new ingresses
    #[arg(long)]
    auto_claim: bool,

    /// Wipe all orphan kong apis when deleting a domain resource
    #[arg(long)]
    wipe_on_delete: bool,

    /// Time to resync a domain in a failed state phase, in seconds
    #[arg(long = "resync-on-fail", default_value_t = 60)]
    resync_on_fail: i64,

    /// Address to bind the health and metrics server on
    #[arg(long, default_value = "0.0.0.0")]
    healthz_bind_address: String,

    /// Port of the health and metrics server, 0 disables it
    #[arg(long, default_value_t = 0)]
    healthz_port: u16,

    /// Print version information and quit
    #[arg(long)]
    version: bool,

    /// Print the Domain CRD manifest and quit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.version {
        println!("{}", serde_json::to_string(&Version::get())?);
        return Ok(());
    }
    if cli.crd {
        let crd = serde_yaml::to_string(&Domain::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    let config = kube_config(&cli).await?;
    let client = Client::try_from(config)
        .map_err(|e| anyhow::anyhow!("failed creating kubernetes client: {e}"))?;

    let kong = KongClient::new(&cli.kong_server)
        .map_err(|e| anyhow::anyhow!("failed retrieving client config for kong: {e}"))?;
    let kong_version = kong
        .server_version()
        .await
        .map_err(|e| anyhow::anyhow!("failed retrieving kong version: {e}"))?;
    tracing::info!(version = %kong_version, "Kong version");
    if kong_version.minor < MINIMAL_MINOR_KONG_VERSION {
        anyhow::bail!(
            "unsupported kong version {kong_version}, require 0.{MINIMAL_MINOR_KONG_VERSION}.0+"
        );
    }

    let mut cfg = Config {
        cluster_dns: cli.cluster_dns.clone(),
        pod_namespace: cli.pod_namespace.clone(),
        auto_claim: cli.auto_claim,
        wipe_on_delete: cli.wipe_on_delete,
        resync_on_failed: cli.resync_on_fail,
    };
    match std::env::var("POD_NAMESPACE") {
        Ok(ns) if !ns.is_empty() => cfg.pod_namespace = ns,
        _ => startup::ensure_namespace(&client, &cfg.pod_namespace).await?,
    }

    startup::ensure_crd_installed(&client)
        .await
        .map_err(|e| anyhow::anyhow!("failed creating domains CRD: {e}"))?;

    if cli.healthz_port > 0 {
        let bind = cli.healthz_bind_address.clone();
        let port = cli.healthz_port;
        tokio::spawn(async move {
            if let Err(e) = monitoring::serve(&bind, port).await {
                tracing::error!(error = %e, "monitoring server failed");
            }
        });
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    KongController::new(client, kong, cfg, RESYNC_PERIOD)
        .run(shutdown)
        .await;
    Ok(())
}

/// Build the client configuration: in-cluster when no api server address is
/// given, otherwise a synthetic kubeconfig carrying the TLS flags.
async fn kube_config(cli: &Cli) -> anyhow::Result<kube::Config> {
    let Some(apiserver) = cli.apiserver.clone().filter(|s| !s.is_empty()) else {
        return kube::Config::incluster()
            .map_err(|e| anyhow::anyhow!("error creating client configuration: {e}"));
    };
    let mut cluster = json!({
        "server": apiserver,
        "insecure-skip-tls-verify": cli.tls_insecure,
    });
    if let Some(ca) = cli.ca_file.clone().filter(|s| !s.is_empty()) {
        cluster["certificate-authority"] = json!(ca);
    }
    let mut user = json!({});
    if let Some(cert) = cli.cert_file.clone().filter(|s| !s.is_empty()) {
        user["client-certificate"] = json!(cert);
    }
    if let Some(key) = cli.key_file.clone().filter(|s| !s.is_empty()) {
        user["client-key"] = json!(key);
    }
    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{"name": "default", "cluster": cluster}],
        "users": [{"name": "default", "user": user}],
        "contexts": [{"name": "default", "context": {"cluster": "default", "user": "default"}}],
        "current-context": "default",
    }))
    .map_err(|e| anyhow::anyhow!("failed building client configuration: {e}"))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("failed building client configuration: {e}"))
}
