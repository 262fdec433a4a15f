//! Logging and tracing configuration
//!
//! Console output goes to stderr so it never mixes with the PASS/FAIL lines
//! printed on stdout. When an output dir is known, a full log with thread ids
//! is also written to `harness.log` inside it.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Name of the log file written into the output root
pub const LOG_FILE_NAME: &str = "harness.log";

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("eostest=debug,info")
        } else {
            EnvFilter::new("eostest=info,warn")
        }
    })
}

/// Initialize tracing for the CLI (stderr logging only)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
pub fn init_cli(verbose: bool) {
    tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for a test run (stderr + `harness.log` in `output_root`)
///
/// The returned guard must be held until the run ends, otherwise buffered
/// file output is lost.
pub fn init_run(verbose: bool, output_root: &Path) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::never(output_root, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .compact();

    tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(file_layer)
        .with(stderr_layer)
        .init();

    guard
}
