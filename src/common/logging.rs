//! Logging and tracing configuration
//!
//! The bridge may own stdout as its DAP channel, so nothing is ever logged
//! there. Logs go to stderr and, when possible, to a daily-rolling file.

use std::time::Instant;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// Target used for timing diagnostics
pub const TIMING_TARGET: &str = "dap_bridge::timing";

/// Initialize tracing (file + stderr logging)
///
/// Log level controlled by `RUST_LOG`, default is INFO for this crate and
/// WARN for dependencies. The returned guard must be held until exit so the
/// file writer flushes.
pub fn init(diagnostics: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if diagnostics {
            EnvFilter::new("dap_bridge=debug,warn")
        } else {
            EnvFilter::new("dap_bridge=info,warn")
        }
    });

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .compact();

    let file = paths::log_dir().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        let appender = tracing_appender::rolling::daily(dir, "dap-bridge.log");
        Some(tracing_appender::non_blocking(appender))
    });

    let (file_layer, guard) = match file {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    guard
}

/// Milestone timer for the `diagnostics` setting
#[derive(Debug, Clone)]
pub struct Diagnostics {
    enabled: bool,
    started: Instant,
}

impl Diagnostics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            started: Instant::now(),
        }
    }

    /// Log a milestone with the time elapsed since the session began
    pub fn mark(&self, milestone: &str) {
        if self.enabled {
            tracing::info!(
                target: TIMING_TARGET,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "{}",
                milestone
            );
        }
    }
}
