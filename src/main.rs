use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use vm_warden::api::{self, AppState};
use vm_warden::hooks::HookRegistry;
use vm_warden::machine::{CheckpointStore, MachineControl, SimulatedMachine, VirshMachine};
use vm_warden::{Config, Controller};

#[derive(Parser)]
#[command(name = "vm-warden")]
#[command(about = "Heartbeat watchdog and snapshot recovery for a single VM", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watchdog and the HTTP API
    Serve {
        #[arg(short, long, help = "Config file (.toml, .yaml or .yml)")]
        config: Option<PathBuf>,

        #[arg(short, long, help = "Override api_port")]
        port: Option<u16>,

        #[arg(long, help = "Use an in-memory VM instead of libvirt")]
        simulate: bool,
    },
    /// Print the effective configuration
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            simulate,
        } => serve(config.as_deref(), port, simulate).await?,
        Commands::Config { config } => print_config(config.as_deref())?,
    }

    Ok(())
}

fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

async fn serve(path: Option<&Path>, port: Option<u16>, simulate: bool) -> Result<()> {
    let mut config = Config::load(path)?;
    if let Some(port) = port {
        config.api_port = port;
    }
    if simulate && config.vm_name.is_empty() {
        config.vm_name = "simulated".to_string();
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config.log_level);
    log::info!("Starting vm-warden {}", env!("CARGO_PKG_VERSION"));
    for (key, value) in config.summary() {
        log::info!("  {}: {}", key, value);
    }

    let (machine, checkpoints): (Arc<dyn MachineControl>, Arc<dyn CheckpointStore>) = if simulate
    {
        log::warn!("Running against a simulated VM");
        let machine = Arc::new(SimulatedMachine::new(config.snapshot_name.as_str()));
        machine.set_running(true);
        (machine.clone(), machine)
    } else {
        let machine = Arc::new(
            VirshMachine::new(config.vm_name.as_str(), config.snapshot_name.as_str())
                .with_command_timeout(Duration::from_secs_f64(config.virsh_timeout))
                .with_agent_timeout(Duration::from_secs_f64(config.guest_agent_timeout)),
        );
        (machine.clone(), machine)
    };

    match checkpoints.reference_exists().await {
        Ok(true) => {}
        Ok(false) => log::warn!(
            "Reference snapshot '{}' does not exist; create it before relying on recovery",
            config.snapshot_name
        ),
        Err(e) => log::warn!("Could not list snapshots: {}", e),
    }

    let controller = Arc::new(Controller::new(machine, config.controller_settings()));
    controller
        .start(config.startup_options())
        .await
        .context("Startup failed")?;

    let hooks = Arc::new(
        HookRegistry::new(&config.hooks_dir).with_error_events(config.error_events.clone()),
    );
    let state = AppState {
        vm_name: config.vm_name.clone(),
        controller: controller.clone(),
        checkpoints,
        hooks,
    };

    let result = api::serve(state, &config.bind_address(), shutdown_signal()).await;
    controller.shutdown().await;
    log::info!("vm-warden stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested");
}

fn print_config(path: Option<&Path>) -> Result<()> {
    let config = Config::load(path)?;
    if let Err(e) = config.validate() {
        eprintln!("warning: {:#}", e);
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
