//! Migration agent - migrate an RKE1 node to RKE2 from an etcd snapshot

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use migration_agent::config::{
    DEFAULT_CONFIG_DIR, DEFAULT_DATA_DIR, DEFAULT_S3_ENDPOINT, DEFAULT_S3_REGION,
};
use migration_agent::download::S3Downloader;
use migration_agent::node::KubeNodeLister;
use migration_agent::{Agent, Error, LocalSteps, MigrationConfig, S3Config};

/// Migrate this RKE1 node's certificates, etcd data and addons to RKE2
#[derive(Parser, Debug)]
#[command(name = "migration-agent", version, about, long_about = None)]
struct Cli {
    /// Kubeconfig of the RKE1 cluster, used for the node annotation lookup
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// RKE2 data directory
    #[arg(long, env = "DATADIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// RKE2 configuration directory
    #[arg(long, default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Directory the snapshot archive is extracted under
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Snapshot archive path, or its object name when downloading from S3
    #[arg(long, env = "SNAPSHOT")]
    snapshot: String,

    /// Node name, address or internal address of this host in the RKE state
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    #[command(flatten)]
    s3: S3Args,

    /// Skip restoring etcd on etcd nodes
    #[arg(long)]
    disable_etcd_restore: bool,

    /// Skip translating ingress, DNS and metrics-server addons
    #[arg(long)]
    disable_addons_migrate: bool,

    /// Skip translating the CNI configuration
    #[arg(long)]
    disable_cni_migrate: bool,

    /// Skip copying user addon manifests
    #[arg(long)]
    disable_user_addons_migrate: bool,

    /// Do not look this node up by annotations in the running cluster
    #[arg(long)]
    disable_node_search: bool,

    /// TLS files for a private registry as `url,ca,cert,key` (repeatable)
    #[arg(long = "registry-tls")]
    registry_tls: Vec<String>,
}

/// Object storage source of the snapshot
#[derive(Args, Debug)]
struct S3Args {
    /// Download the snapshot from this S3 bucket
    #[arg(long, env = "S3_BUCKET")]
    s3_bucket: Option<String>,

    /// S3 endpoint host, optionally with scheme
    #[arg(long, env = "S3_ENDPOINT", default_value = DEFAULT_S3_ENDPOINT)]
    s3_endpoint: String,

    /// PEM bundle to verify the S3 endpoint with
    #[arg(long, env = "S3_ENDPOINT_CA")]
    s3_endpoint_ca: Option<PathBuf>,

    /// Do not verify the S3 endpoint certificate
    #[arg(long)]
    s3_skip_ssl_verify: bool,

    /// S3 access key
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    s3_access_key: Option<String>,

    /// S3 secret key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    s3_secret_key: Option<String>,

    /// S3 bucket region
    #[arg(long, env = "S3_REGION", default_value = DEFAULT_S3_REGION)]
    s3_region: String,

    /// Folder inside the bucket holding the snapshot
    #[arg(long, env = "S3_FOLDER")]
    s3_folder: Option<String>,

    /// Timeout for the snapshot download in seconds
    #[arg(long, default_value = "300")]
    s3_timeout_secs: u64,
}

impl S3Args {
    fn into_config(self) -> Result<Option<S3Config>, Error> {
        let Some(bucket) = self.s3_bucket.filter(|b| !b.is_empty()) else {
            return Ok(None);
        };
        if self.s3_endpoint.is_empty() {
            return Err(Error::validation("--s3-endpoint must not be empty"));
        }
        Ok(Some(S3Config {
            endpoint: self.s3_endpoint,
            endpoint_ca: self.s3_endpoint_ca,
            skip_ssl_verify: self.s3_skip_ssl_verify,
            access_key: self.s3_access_key,
            secret_key: self.s3_secret_key,
            bucket,
            region: self.s3_region,
            folder: self.s3_folder,
            timeout: Duration::from_secs(self.s3_timeout_secs),
        }))
    }
}

impl TryFrom<Cli> for MigrationConfig {
    type Error = Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.snapshot.trim().is_empty() {
            return Err(Error::validation("--snapshot must not be empty"));
        }
        let s3 = cli.s3.into_config()?;

        let mut config = MigrationConfig::new(cli.snapshot);
        config.kubeconfig = cli.kubeconfig;
        config.data_dir = cli.data_dir;
        config.config_dir = cli.config_dir;
        if let Some(work_dir) = cli.work_dir {
            config.work_dir = work_dir;
        }
        config.s3 = s3;
        config.node_name = cli.node_name;
        config.disable_etcd_restore = cli.disable_etcd_restore;
        config.disable_addons_migrate = cli.disable_addons_migrate;
        config.disable_cni_migrate = cli.disable_cni_migrate;
        config.disable_user_addons_migrate = cli.disable_user_addons_migrate;
        config.disable_node_search = cli.disable_node_search;
        config.registries_tls = cli.registry_tls;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!(error = format!("{e:#}"), "Migration failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = MigrationConfig::try_from(cli)?;
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let mut agent = Agent::new(&config, Box::new(LocalSteps::from_config(&config)));

    if let Some(s3) = &config.s3 {
        agent = agent.with_downloader(Box::new(S3Downloader::new(s3.clone())?));
    }

    if !config.disable_node_search {
        match kube_client(config.kubeconfig.as_deref(), &cancel).await {
            Ok(client) => agent = agent.with_node_lister(Box::new(KubeNodeLister::new(client))),
            Err(e) if cancel.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Cluster API unreachable, node annotation lookup disabled")
            }
        }
    }

    let report = agent.run(&cancel).await?;
    tracing::info!(
        node = %report.node_name,
        roles = %report.roles,
        steps = report.steps.len(),
        "Node migrated to RKE2"
    );
    Ok(())
}

/// Cancel `cancel` on the first SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => tracing::warn!("Received SIGINT, cancelling migration"),
            _ = terminate.recv() => tracing::warn!("Received SIGTERM, cancelling migration"),
        }
        cancel.cancel();
    });
    Ok(())
}

/// Client for the RKE1 cluster, verified by a version call
async fn kube_client(
    kubeconfig: Option<&std::path::Path>,
    cancel: &CancellationToken,
) -> anyhow::Result<Client> {
    let kube_config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => kube::Config::infer().await?,
    };
    let client = Client::try_from(kube_config)?;
    let version = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
        version = client.apiserver_version() => version?,
    };
    tracing::debug!(version = %version.git_version, "Connected to cluster API");
    Ok(client)
}
