#![forbid(unsafe_code)]
//! Operator CLI for a KioskMesh node

use clap::{Parser, Subcommand};
use colored::*;
use kioskmesh::attestation::HardwareAttestor;
use kioskmesh::blockchain::validate_chain;
use kioskmesh::config::{load_config_from, Config, DEFAULT_CONFIG_PATH};
use kioskmesh::error::KioskError;
use kioskmesh::node::Node;
use kioskmesh::persistence::{ChainStore, JsonChainStore};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiosk-node")]
#[command(about = "KioskMesh - trust fabric for kiosk fleets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node: peer network, mining (if enabled) and the admin API
    Run {
        /// Do not serve the admin API
        #[arg(long)]
        no_api: bool,
    },

    /// Run the hardware checks and print the verdict
    Attest,

    /// Validate the persisted ledger
    VerifyChain,

    /// Issue an access token for a device
    IssueToken {
        /// Device identifier
        #[arg(short, long)]
        device_id: String,

        /// Comma-separated permissions
        #[arg(short, long, value_delimiter = ',')]
        permissions: Vec<String>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = match load_config_from(&cli.config) {
        Ok(config) => match cli.command {
            Commands::Run { no_api } => run(config, no_api).await,
            Commands::Attest => attest(),
            Commands::VerifyChain => verify_chain(&config),
            Commands::IssueToken {
                device_id,
                permissions,
            } => issue_token(config, &device_id, &permissions).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, no_api: bool) -> Result<(), KioskError> {
    let api_addr = format!("{}:{}", config.network.bind_address, config.network.api_port);
    let node = Node::open(config, HardwareAttestor::default())?;
    let addr = node.start().await?;
    println!(
        "{} {} on {}",
        "KioskMesh node".bright_cyan().bold(),
        node.config().node.peer_id.bright_white(),
        addr
    );

    let api_task = if no_api {
        None
    } else {
        start_api(node.clone(), &api_addr)?
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
    node.shutdown().await;
    if let Some((task, stop)) = api_task {
        let _ = stop.send(());
        match task.await {
            Ok(Err(e)) => warn!("Admin API: {}", e),
            Err(e) => warn!("Admin API task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

type ApiTask = (
    tokio::task::JoinHandle<Result<(), KioskError>>,
    tokio::sync::oneshot::Sender<()>,
);

#[cfg(feature = "api")]
fn start_api(node: std::sync::Arc<Node>, addr: &str) -> Result<Option<ApiTask>, KioskError> {
    let addr = addr
        .parse()
        .map_err(|e| KioskError::Config(format!("Invalid admin API address {}: {}", addr, e)))?;
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(kioskmesh::api::run_api_server(node, addr, async move {
        let _ = stopped.await;
    }));
    Ok(Some((task, stop)))
}

#[cfg(not(feature = "api"))]
fn start_api(_node: std::sync::Arc<Node>, _addr: &str) -> Result<Option<ApiTask>, KioskError> {
    warn!("Built without the api feature; admin API disabled");
    Ok(None)
}

fn attest() -> Result<(), KioskError> {
    let report = HardwareAttestor::default().verify_eligibility();
    println!("{}", "Hardware attestation".bright_cyan().bold());
    println!("  model:          {}", report.hardware_model);
    println!(
        "  confidence:     {:.2} (weighted {:.2})",
        report.confidence_score, report.weighted_score
    );
    for check in report.checks.iter().chain(report.anti_spoofing.iter()) {
        let mark = if check.passed { "ok".green() } else { "FAIL".red() };
        println!("  {:<20} {:<4} {}", check.name, mark, check.detail);
    }
    println!(
        "  anti-spoofing:  {}/{}",
        report.anti_spoofing_score,
        report.anti_spoofing.len()
    );
    if report.mining_allowed() {
        println!("{}", "Eligible for mining".bright_green().bold());
    } else {
        println!("{}", "Not eligible for mining; staking only".yellow().bold());
    }
    Ok(())
}

fn verify_chain(config: &Config) -> Result<(), KioskError> {
    let store = JsonChainStore::new(&config.storage.data_dir);
    let chain = store
        .load_chain()?
        .ok_or_else(|| KioskError::Persistence(format!("No ledger in {}", config.storage.data_dir.display())))?;
    validate_chain(&chain)?;
    println!(
        "{} {} blocks, tip {}",
        "Ledger valid:".bright_green().bold(),
        chain.len(),
        chain.last().map(|b| b.hash.as_str()).unwrap_or("-")
    );
    Ok(())
}

async fn issue_token(config: Config, device_id: &str, permissions: &[String]) -> Result<(), KioskError> {
    let node = Node::open(config, HardwareAttestor::default())?;
    let token = node.generate_token(device_id, permissions)?;
    // The issuance is already saved in pending.json; mining here only saves
    // waiting for the next block.
    match node.mine_once().await {
        Ok(Some(mined)) => info!("Issuance recorded in block {}", mined.block.index),
        Ok(None) => info!("Issuance pending until the next mined block"),
        Err(e) => info!("Issuance pending until the next mined block ({})", e),
    }
    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}
