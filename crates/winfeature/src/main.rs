//! winfeature
//!
//! Installs Windows features and capabilities on a target machine, restarting
//! it until no reboot is pending.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use winfeature_core::{Provisioner, ScriptTemplates};

mod config;
mod factory;
mod progress;

use config::Config;

const EVENT_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "winfeature", version)]
#[command(about = "Install Windows features and capabilities, restarting as needed", long_about = None)]
struct Cli {
    /// Config file (defaults to WINFEATURE_CONFIG or the standard locations)
    #[arg(short, long, env = config::CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Target host; overrides `connection.host`
    #[arg(long)]
    host: Option<String>,

    /// SSH port; overrides `connection.port`
    #[arg(long)]
    port: Option<u16>,

    /// SSH user; overrides `connection.user`
    #[arg(long)]
    user: Option<String>,

    /// Windows feature to install (repeatable); replaces the configured list
    #[arg(short = 'f', long = "feature")]
    features: Vec<String>,

    /// Windows capability to install (repeatable); replaces the configured list
    #[arg(short = 'C', long = "capability")]
    capabilities: Vec<String>,

    /// Seconds to wait for the machine after each restart
    #[arg(long)]
    restart_timeout: Option<u64>,

    /// Log level; `RUST_LOG` takes precedence
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs and progress events as JSON lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.connection.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.connection.port = port;
        }
        if let Some(user) = &self.user {
            config.connection.user.clone_from(user);
        }
        if !self.features.is_empty() {
            config.provision.features.clone_from(&self.features);
        }
        if !self.capabilities.is_empty() {
            config.provision.capabilities.clone_from(&self.capabilities);
        }
        if let Some(secs) = self.restart_timeout {
            config.provision.restart_timeout = Duration::from_secs(secs);
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if self.json {
            config.log.json = true;
        }
    }
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(Config::find_default);
    let mut config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    init_tracing(&config)?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "starting"
    );
    match &config_path {
        Some(path) => info!(path = %path.display(), "loaded config"),
        None => warn!("no config file found, using defaults"),
    }
    if !config.provision.has_work() {
        warn!("no features or capabilities configured; only the reboot cycle will run");
    }

    let executor = factory::create_executor(&config.connection)?;
    let (event_tx, event_rx) = broadcast::channel(EVENT_CAPACITY);
    let provisioner = Provisioner::new(
        config.provision,
        ScriptTemplates::builtin(),
        executor,
        event_tx,
    )?;

    let printer = tokio::spawn(progress::print_events(event_rx, config.log.json));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let result = provisioner.provision(&cancel).await;

    // Closes the event channel so the printer drains and exits
    drop(provisioner);
    printer.await?;

    let report = match result {
        Ok(report) => report,
        Err(e) if e.is_cancelled() => {
            warn!("provisioning cancelled; the target is left as-is");
            return Err(eyre::Report::new(e));
        }
        Err(e) => return Err(eyre::Report::new(e).wrap_err("provisioning failed")),
    };
    info!(
        restarts = report.restarts,
        elapsed = ?report.elapsed,
        "done"
    );
    Ok(())
}
