//! relayd - detection relay daemon
//!
//! This daemon:
//! 1. Loads configuration and refuses to start without both credentials
//! 2. Restores the per-device ledger (local file, then remote archive)
//! 3. Serves `/upload`, `/summary` and health endpoints until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use detect_relay::api::{ApiConfig, ApiServer};
use detect_relay::{
    Archiver, GithubContentStore, LedgerSource, LedgerStore, Relay, RelayConfig, RoboflowGateway,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay camera frames to a detection workflow")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding config and environment.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = RelayConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }
    log::info!(
        "target label '{}' at confidence >= {}",
        config.detection.target_label,
        config.detection.min_confidence
    );

    std::fs::create_dir_all(&config.spool_dir)?;

    let archiver = Archiver::new(
        Box::new(GithubContentStore::new(&config.archive)),
        &config.archive,
    );
    let ledger = LedgerStore::open(&config.ledger_path, &[&archiver as &dyn LedgerSource]);
    let restored = ledger.snapshot()?;
    log::info!(
        "ledger file {} ({} devices, total {})",
        ledger.path().display(),
        restored.per_esp.len(),
        restored.total_all_esp
    );
    let gateway = RoboflowGateway::new(&config.inference);
    log::info!("inference workflow at {}", gateway.endpoint());

    let relay = Arc::new(Relay::new(
        &config.detection,
        &config.spool_dir,
        Box::new(gateway),
        archiver,
        ledger,
    ));

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        token: config.api_token.clone(),
    };
    let api_handle = ApiServer::new(api_config, relay).spawn()?;
    log::info!("relay api listening on {}", api_handle.addr);
    if config.api_token.is_none() {
        log::warn!("RELAY_API_TOKEN not set; /upload and /summary are unauthenticated");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("relayd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
