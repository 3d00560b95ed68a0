//! moku-mcp: MCP server for Moku instrument discovery and configuration
//!
//! Lets AI assistants find Moku devices on the local network, take exclusive
//! ownership of one, and deploy multi-instrument configurations to it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use moku_mcp::config::{self, Config};
use moku_mcp::mcp::{McpServer, ToolContext};
use moku_mcp::moku::mock::simulated_lab;
use moku_mcp::moku::{
    DeviceCache, DeviceConnector, DiscoveryClient, HttpConnector, MdnsBrowser, ServiceBrowser,
    SessionManager,
};

/// MCP server for Moku instrument discovery and configuration.
///
/// Speaks MCP over stdin/stdout; logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "moku-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,

    /// Use a simulated Moku:Go instead of the network
    #[arg(long)]
    simulate: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Wires the device backend, cache and discovery into a tool context.
fn build_tools(cfg: &Config, simulate: bool) -> Result<ToolContext, String> {
    let connector: Arc<dyn DeviceConnector>;
    let browser: Box<dyn ServiceBrowser>;
    if simulate {
        let (mock, static_browser) = simulated_lab();
        info!("Simulation mode: using an in-memory Moku:Go");
        connector = Arc::new(mock);
        browser = Box::new(static_browser);
    } else {
        let http = HttpConnector::new(cfg.device.request_timeout())
            .map_err(|e| format!("HTTP client error: {e}"))?;
        connector = Arc::new(http);
        browser = Box::new(MdnsBrowser);
    }

    let cache = if simulate {
        DeviceCache::in_memory()
    } else if let Some(path) = cfg.resolved_cache_path() {
        DeviceCache::load(path)
    } else {
        warn!("No home directory, device cache will not be persisted");
        DeviceCache::in_memory()
    };

    let discovery = DiscoveryClient::new(
        browser,
        Arc::clone(&connector),
        cfg.discovery.service_type.clone(),
        cfg.discovery.enrich_metadata,
    );
    let sessions = SessionManager::new(connector, cfg.device.http_port);

    Ok(ToolContext::new(
        sessions,
        cache,
        discovery,
        cfg.discovery.default_timeout(),
    ))
}

/// Entry point for the moku-mcp server.
fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_some() {
                eprintln!("See config/example-config.json for the expected format");
            }
            return ExitCode::FAILURE;
        }
    };

    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    // GPLv3 Section 5d notice
    eprintln!(
        "moku-mcp {}  Copyright (C) 2026  The Moku MCP Contributors",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        simulate = args.simulate,
        "Starting moku-mcp server"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let tools = build_tools(&cfg, args.simulate).map_err(std::io::Error::other)?;
        let mut server = McpServer::stdio(tools);
        info!("MCP server ready, waiting for client connection...");
        server.run().await
    });

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn cli_flags_override_config_level() {
        assert_eq!(get_log_level(0, false, "debug"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "nonsense"), Level::WARN);
        assert_eq!(get_log_level(2, false, "error"), Level::DEBUG);
        assert_eq!(get_log_level(3, true, "trace"), Level::ERROR);
    }

    #[test]
    fn parse_simulate_flag() {
        let args = Args::parse_from(["moku-mcp", "--simulate", "-vv", "bench.json"]);
        assert!(args.simulate);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.config, Some(PathBuf::from("bench.json")));
    }

    #[tokio::test]
    async fn simulated_tools_build() {
        let tools = build_tools(&Config::default(), true).unwrap();
        assert!(!tools.sessions().is_attached());
        assert!(tools.cache().path().is_none());
    }
}
