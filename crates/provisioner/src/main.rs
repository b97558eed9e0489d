use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vs_provisioner::{
    api::VirtualServer,
    builder::{self, VmIdentity},
    client::{DeleteOutcome, KubeVirtualServerClient},
    config::ProvisionConfig,
    orchestrator::Orchestrator,
    template::BootstrapValues,
};

/// Conventional exit status after SIGINT.
const INTERRUPTED: u8 = 130;

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    /// YAML file with provisioning settings; defaults apply when omitted
    #[arg(long, global = true, env = "VS_PROVISIONER_CONFIG")]
    config: Option<PathBuf>,
    /// Override the namespace from the config file
    #[arg(long, global = true, env = "NAMESPACE")]
    namespace: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Replace the VirtualServer and wait for it to be running
    Provision {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        bootstrap: Bootstrap,
        #[command(flatten)]
        login: Login,
        /// Overall readiness deadline, e.g. `15m`
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
        /// Wait between readiness checks, e.g. `5s`
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
        /// State to wait for
        #[arg(long)]
        expected_state: Option<String>,
    },
    /// Print the VirtualServer manifest without touching the cluster
    Render {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        bootstrap: Bootstrap,
        #[command(flatten)]
        login: Login,
    },
    /// Delete the VirtualServer if it exists
    Delete {
        #[command(flatten)]
        target: Target,
    },
    /// Output K8s manifest for the VirtualServer CRD
    CrdManifest,
}

#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = true)]
struct Target {
    /// Project id; the server is named <namePrefix><project-id> unless --name is given
    #[arg(long)]
    project_id: Option<String>,
    /// Exact server name; --project-id still feeds the startup script
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct Bootstrap {
    /// Link handed to the startup script
    #[arg(long)]
    link: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct Login {
    /// Extra login user, added to those in the config file
    #[arg(long, env = "VS_USERNAME")]
    username: Option<String>,
    /// Public key for --username
    #[arg(long, env = "VS_SSH_PUBLIC_KEY")]
    ssh_public_key: Option<String>,
}

impl Target {
    fn identity(&self, config: &ProvisionConfig) -> vs_provisioner::Result<VmIdentity> {
        match &self.name {
            Some(name) => VmIdentity::new(name, &config.namespace),
            None => VmIdentity::from_project(
                &config.name_prefix,
                self.project_id.as_deref().unwrap_or_default(),
                &config.namespace,
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()?;

    let cli = Cli::parse();

    let mut config = ProvisionConfig::load(cli.config.as_deref())?;
    if let Some(namespace) = cli.namespace.clone() {
        config.namespace = namespace;
    }

    match cli.command {
        Commands::Provision {
            target,
            bootstrap,
            login,
            timeout,
            interval,
            expected_state,
        } => {
            let mut config = login.apply(config);
            if let Some(timeout) = timeout {
                config.readiness.timeout = timeout;
            }
            if let Some(interval) = interval {
                config.readiness.interval = interval;
            }
            if let Some(expected_state) = expected_state {
                config.readiness.expected_state = expected_state;
            }
            config.check()?;
            provision(&config, &target, &bootstrap).await
        }
        Commands::Render {
            target,
            bootstrap,
            login,
        } => {
            let config = login.apply(config);
            config.check()?;
            let (_, server) = build(&config, &target, &bootstrap)?;
            print!("{}", builder::render_manifest(&server)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { target } => {
            config.check()?;
            delete(&config, &target).await
        }
        Commands::CrdManifest => {
            println!("{}", serde_yaml_ng::to_string(&VirtualServer::crd())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

impl Login {
    fn apply(self, config: ProvisionConfig) -> ProvisionConfig {
        match self.username {
            Some(username) => config.with_user(username, self.ssh_public_key),
            None => config,
        }
    }
}

fn build(
    config: &ProvisionConfig,
    target: &Target,
    bootstrap: &Bootstrap,
) -> anyhow::Result<(VmIdentity, VirtualServer)> {
    let identity = target.identity(config)?;
    tracing::info!("Name = {}, length = {}", identity.name, identity.name.len());

    let values = BootstrapValues {
        project_id: target.project_id.clone(),
        link: bootstrap.link.clone(),
        ..Default::default()
    };
    let server = builder::build(config, &identity, &values)
        .with_context(|| format!("build VirtualServer {identity}"))?;

    Ok((identity, server))
}

async fn connect() -> anyhow::Result<KubeVirtualServerClient> {
    let client = Client::try_default().await.context("connect to k8s")?;
    Ok(KubeVirtualServerClient::new(client))
}

async fn provision(
    config: &ProvisionConfig,
    target: &Target,
    bootstrap: &Bootstrap,
) -> anyhow::Result<ExitCode> {
    let (identity, server) = build(config, target, bootstrap)?;
    let orchestrator = Orchestrator::new(connect().await?, config.readiness.clone());

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match orchestrator
        .provision_until(&identity, &server, interrupted)
        .await
    {
        Some(outcome) => {
            println!("VirtualServer {identity}: {outcome}");
            Ok(ExitCode::from(outcome.exit_code() as u8))
        }
        None => {
            println!("VirtualServer {identity}: interrupted");
            Ok(ExitCode::from(INTERRUPTED))
        }
    }
}

async fn delete(config: &ProvisionConfig, target: &Target) -> anyhow::Result<ExitCode> {
    let identity = target.identity(config)?;
    let orchestrator = Orchestrator::new(connect().await?, config.readiness.clone());

    match orchestrator.teardown(&identity).await {
        Ok(DeleteOutcome::Deleted) => println!("VirtualServer {identity} deleted"),
        Ok(DeleteOutcome::NotFound) => println!("VirtualServer {identity} already deleted"),
        Err(e) => {
            println!("VirtualServer {identity} delete exception {e}");
            return Ok(ExitCode::FAILURE);
        }
    }

    Ok(ExitCode::SUCCESS)
}
