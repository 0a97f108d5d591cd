//! Command-line interface for the Dash node.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use tokio::signal;

use dash_node::import::import_blocks;
use dash_node::logging::parse_level;
use dash_node::{init_logging, Config, LoggingConfig, Network, Node};

/// How often expired orphans are dropped while the node runs.
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("dash-node")
        .version(dash_node::VERSION)
        .about("Dash node chain-acceptance engine")
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .help("Network whose genesis block starts the chain")
                .value_parser(["mainnet", "testnet", "regtest"])
                .default_value("mainnet"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory for block files and the pending journal")
                .default_value("./dash-node-data"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Also write logs to DIR/run.log, archiving previous runs"),
        )
        .arg(
            Arg::new("max-file-size")
                .long("max-file-size")
                .value_name("BYTES")
                .help("Maximum size of a single record file")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("import")
                .long("import")
                .value_name("FILE")
                .help("Import a file of concatenated consensus-encoded blocks, then exit"),
        )
        .arg(
            Arg::new("no-journal")
                .long("no-journal")
                .help("Do not persist pending headers, bodies and orphans across restarts")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-json")
                .long("stats-json")
                .help("Print node statistics as JSON on exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = matches.get_one::<String>("log-level").map(String::as_str).unwrap_or("info");
    let mut logging = LoggingConfig::console(Some(parse_level(log_level)?));
    if let Some(log_dir) = matches.get_one::<String>("log-dir") {
        logging = logging.with_log_dir(log_dir);
    }
    let _logging_guard = init_logging(logging)?;

    let network = match matches.get_one::<String>("network").map(String::as_str) {
        Some("testnet") => Network::Testnet,
        Some("regtest") => Network::Regtest,
        _ => Network::Dash,
    };
    let data_dir = matches
        .get_one::<String>("data-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./dash-node-data"));

    let mut config = Config::new(network)
        .with_data_dir(data_dir)
        .with_journal_pending(!matches.get_flag("no-journal"));
    if let Some(size) = matches.get_one::<u64>("max-file-size") {
        config = config.with_max_record_file_size(*size);
    }

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        process::exit(1);
    }

    tracing::info!("Starting Dash node");
    tracing::info!("Network: {:?}", network);
    tracing::info!("Data directory: {}", config.data_dir.display());

    let node = match Node::open(config) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            eprintln!("Failed to open node: {}", e);
            process::exit(1);
        }
    };

    if let Some(path) = matches.get_one::<String>("import") {
        let summary = import_blocks(node.clone(), PathBuf::from(path)).await?;
        println!(
            "Imported {} blocks: {} committed, {} already known, {} pending",
            summary.blocks_read, summary.blocks_committed, summary.duplicates, summary.left_pending
        );
    } else {
        tracing::info!("Node running at tip {}. Press Ctrl-C to stop.", node.tip()?);
        let mut sweep = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    node.expire_orphans();
                }
                result = signal::ctrl_c() => {
                    result?;
                    tracing::info!("Received shutdown signal");
                    break;
                }
            }
        }
    }

    node.flush()?;
    let stats = node.stats()?;
    if matches.get_flag("stats-json") {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        tracing::info!("Stopped at tip {} (height {})", stats.tip_hash, stats.tip_height);
    }

    Ok(())
}
