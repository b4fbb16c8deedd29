//! Command-line interface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use self_host_connector::cloud_init::CloudInitPackager;
use self_host_connector::control_loop::{shutdown_signal, ControlLoop, CycleOutcome, PollSchedule};
use self_host_connector::daemon::{DaemonSupervisor, OsProcessControl};
use self_host_connector::pairing::{self, PairOptions};
use self_host_connector::{
    AgentInfo, Configuration, ControlPlaneClient, Dispatcher, Multipass, Paths, ProcessRunner,
    StateStore,
};
use tokio::time::Instant;
use tracing::info;

use crate::error::CliError;

/// Connects this machine to a CoCalc control plane and runs its VM commands
/// through Ubuntu Multipass.
#[derive(Debug, Parser)]
#[command(name = "cocalc-self-host-connector", disable_version_flag = true)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print the version.
    #[arg(short = 'V', long = "version")]
    pub version: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Pair with the control plane and save credentials.
    Pair(PairArgs),

    /// Run the poll loop in the foreground, or in the background with --daemon.
    Run(RunArgs),

    /// Stop the background daemon.
    Stop(ConfigArgs),

    /// Poll once, run at most one command, and exit.
    Once(ConfigArgs),

    /// Print the version.
    Version,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Config file path.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct PairArgs {
    /// Control plane base URL (e.g. https://cocalc.com).
    #[arg(long = "base-url", visible_alias = "url", value_name = "URL")]
    pub base_url: String,

    /// Pairing token.
    #[arg(long)]
    pub token: String,

    /// Connector name shown in the control plane.
    #[arg(long)]
    pub name: Option<String>,

    /// Replace an existing config.
    #[arg(long)]
    pub replace: bool,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Run in the background.
    #[arg(long)]
    pub daemon: bool,

    #[command(flatten)]
    pub config: ConfigArgs,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let agent = AgentInfo::detect();
        if self.version {
            println!("{}", agent.version);
            return Ok(());
        }

        match self.command {
            Some(Commands::Pair(args)) => pair(args, &agent).await,
            Some(Commands::Run(args)) if args.daemon => start_daemon(args.config),
            Some(Commands::Run(args)) => run_loop(args.config, &agent).await,
            Some(Commands::Stop(args)) => stop_daemon(args).await,
            Some(Commands::Once(args)) => once(args).await,
            Some(Commands::Version) => {
                println!("{}", agent.version);
                Ok(())
            }
            None => {
                Cli::command().print_help()?;
                Ok(())
            }
        }
    }
}

async fn pair(args: PairArgs, agent: &AgentInfo) -> Result<()> {
    let paths = Paths::resolve(args.config.config)?;
    let options = PairOptions {
        base_url: args.base_url,
        pairing_token: args.token,
        name: args.name,
        replace: args.replace,
    };

    let config = pairing::pair(&paths, &options, agent).await?;
    println!(
        "Paired connector {} (config: {})",
        config.connector_id,
        paths.config().display()
    );
    Ok(())
}

fn start_daemon(args: ConfigArgs) -> Result<()> {
    let paths = Paths::resolve(args.config)?;
    let log = paths.log();
    let pid = DaemonSupervisor::new(paths, OsProcessControl).start()?;
    println!("Connector daemon started (pid {pid}, log: {})", log.display());
    Ok(())
}

async fn stop_daemon(args: ConfigArgs) -> Result<()> {
    let paths = Paths::resolve(args.config)?;
    let pid = DaemonSupervisor::new(paths, OsProcessControl).stop().await?;
    println!("Connector daemon stopped (pid {pid})");
    Ok(())
}

/// Load config and wire up the loop.
fn build_loop(paths: &Paths) -> Result<(ControlLoop, Multipass)> {
    let config = Configuration::load_paired(paths.config())?;
    let multipass = Multipass::new(Arc::new(ProcessRunner));
    let packager = CloudInitPackager::from_env()?;
    let dispatcher = Dispatcher::new(multipass.clone(), StateStore::load(paths.state()), packager);
    let client = ControlPlaneClient::from_config(&config).context("failed to build HTTP client")?;
    let schedule = PollSchedule::new(config.poll_interval_seconds, Instant::now());

    Ok((ControlLoop::new(client, dispatcher, schedule), multipass))
}

async fn run_loop(args: ConfigArgs, agent: &AgentInfo) -> Result<()> {
    let paths = Paths::resolve(args.config)?;
    let (control_loop, multipass) = build_loop(&paths)?;

    let version = multipass
        .version()
        .await
        .map_err(CliError::MultipassUnavailable)?;
    info!(
        connector_version = %agent.version,
        os = %agent.os,
        arch = %agent.arch,
        multipass = %version.lines().next().unwrap_or_default(),
        config = %paths.config().display(),
        "Starting connector"
    );

    let shutdown = shutdown_signal().context("failed to install signal handlers")?;
    control_loop.run(shutdown).await;
    Ok(())
}

async fn once(args: ConfigArgs) -> Result<()> {
    let paths = Paths::resolve(args.config)?;
    let (mut control_loop, _) = build_loop(&paths)?;

    match control_loop.poll_once().await.context("poll failed")? {
        CycleOutcome::Idle => info!("No pending commands"),
        CycleOutcome::Handled => info!("Handled one command"),
    }
    Ok(())
}
