use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wasm_bridge_host::{BridgeConfig, GrowthPolicy, GuestInstance};
use wasmtime::{Engine, Module};

#[derive(Parser)]
#[command(name = "bridge-host")]
#[command(about = "Run a wasm guest with the object bridge imports.", long_about = None)]
struct Cli {
    /// Guest module (.wasm or .wat).
    module: PathBuf,

    /// Export to call after instantiation.
    #[arg(long, default_value = "_start")]
    entry: String,

    /// JSON bridge config; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_name = "EXPORT")]
    memory: Option<String>,

    #[arg(long, value_name = "EXPORT")]
    allocator: Option<String>,

    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    #[arg(long, value_name = "slack|exact")]
    growth: Option<GrowthPolicy>,
}

impl Cli {
    fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::from_file(path)?,
            None => BridgeConfig::default(),
        };
        if let Some(name) = &self.memory {
            config.memory_export = name.clone();
        }
        if let Some(name) = &self.allocator {
            config.allocator_export = name.clone();
        }
        if let Some(ms) = self.timeout_ms {
            config.execution_timeout_ms = Some(ms);
        }
        if let Some(growth) = self.growth {
            config.growth = growth;
        }
        Ok(config)
    }
}

fn run(cli: Cli) -> Result<Option<i32>> {
    let config = cli.bridge_config()?;
    let engine = Engine::default();
    let module = Module::from_file(&engine, &cli.module)
        .with_context(|| format!("loading {}", cli.module.display()))?;

    let mut guest = GuestInstance::new(&engine, &module, &config)?;
    info!(module = %cli.module.display(), entry = %cli.entry, "guest instantiated");

    let result = guest.call_entry(&cli.entry)?;
    if let Some(bridge) = guest.bridge() {
        info!(
            live_handles = bridge.handles().live(),
            modules = bridge.engine().module_count(),
            "guest finished"
        );
    }
    Ok(result)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(Some(value)) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bridge-host: {e:#}");
            ExitCode::FAILURE
        }
    }
}
