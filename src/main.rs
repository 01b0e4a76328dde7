//! dap-bridge - mixed-mode Debug Adapter Protocol bridge
//!
//! Editors launch this executable as their debug adapter. It speaks DAP to
//! the editor and fans the session out to a managed-language backend and a
//! native-code backend.

use std::path::PathBuf;

use clap::Parser;
use dap_bridge::bridge;
use dap_bridge::common::{config::Config, logging};

#[derive(Parser)]
#[command(name = "dap-bridge", about = "Mixed-mode DAP bridge for managed and native debugging")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Talk DAP over stdin/stdout (default)
    #[arg(long, conflicts_with = "listen")]
    stdio: bool,

    /// Accept one DAP client on this TCP address instead of stdio
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let guard = logging::init(config.diagnostics);

    let result = match cli.listen.as_deref() {
        Some(addr) => bridge::serve_tcp(&config, addr).await,
        None => {
            if !cli.stdio {
                tracing::debug!("No transport given; defaulting to stdio");
            }
            bridge::serve_stdio(&config).await
        }
    };

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {e}");
            1
        }
    };

    // Flush the file log before exiting
    drop(guard);
    std::process::exit(code);
}
