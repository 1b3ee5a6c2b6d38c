//! Engram RPC Server
//!
//! Stdio JSON-RPC 2.0 façade over the engram memory engine:
//!
//! - Hybrid search (vector + BM25) with rule-based rescoring
//! - Cross-encoder reranking behind a three-tier cache
//! - Project memory pools and session-driven cache warming
//! - Background consolidation (migration, clustering, forgetting)

mod engine;
mod protocol;
mod server;
mod sessionlog;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use crate::engine::Engine;
use crate::protocol::stdio::StdioTransport;
use crate::server::RpcServer;

/// Parse command-line arguments, returning the optional data directory.
/// Exits the process for `--help` / `--version`.
fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut data_dir: Option<PathBuf> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!("Engram RPC Server v{}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Conversational memory engine over stdio JSON-RPC.");
                println!();
                println!("USAGE:");
                println!("    engram-rpc [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help              Print help information");
                println!("    -V, --version           Print version information");
                println!("    --data-dir <PATH>       Custom data directory");
                println!();
                println!("ENVIRONMENT:");
                println!("    RUST_LOG                Log level filter (e.g., debug, info, warn)");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("engram-rpc {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--data-dir" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                data_dir = Some(PathBuf::from(&args[i]));
            }
            arg if arg.starts_with("--data-dir=") => {
                let path = arg.strip_prefix("--data-dir=").unwrap_or("");
                if path.is_empty() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                data_dir = Some(PathBuf::from(path));
            }
            arg => {
                eprintln!("error: unknown argument '{arg}'");
                eprintln!("Try 'engram-rpc --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    data_dir
}

fn default_data_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("dev", "engram", "engram") {
        return dirs.data_local_dir().to_path_buf();
    }
    PathBuf::from(".engram")
}

fn main() {
    let data_dir = parse_args().unwrap_or_else(default_data_dir);

    // Logging goes to stderr; stdout is the JSON-RPC channel
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("Engram RPC Server v{} starting...", env!("CARGO_PKG_VERSION"));

    let engine = match Engine::init(&data_dir) {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to initialize engine: {e:#}");
            std::process::exit(1);
        }
    };

    // Periodic consolidation keeps tiers and forgetting up to date
    {
        let consolidation = engine.consolidation.clone();
        let interval_hours = engine.config.consolidation.interval_hours.max(1);
        std::thread::spawn(move || {
            // Small delay so startup never races the stdio handshake
            std::thread::sleep(Duration::from_secs(2));
            loop {
                let stats = consolidation.consolidate();
                info!(
                    migrated = stats.migrated_count,
                    clusters = stats.clusters_created,
                    compressed = stats.memories_compressed,
                    deleted = stats.memories_deleted,
                    duration_s = stats.duration_seconds,
                    "periodic consolidation complete"
                );
                std::thread::sleep(Duration::from_secs(interval_hours * 3600));
            }
        });
    }

    let server = RpcServer::new(engine);
    let transport = StdioTransport::new();

    info!("serving JSON-RPC on stdio");
    if let Err(e) = transport.run(server) {
        error!("server error: {e}");
        std::process::exit(1);
    }

    info!("Engram RPC Server shutting down");
}
