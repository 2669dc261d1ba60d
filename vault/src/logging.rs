//! Diagnostic tracing for operators.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted in the vault.
//!
//! - **Audit log (`io/audit`)** and **Ralph logs (`io/ralph_log`)**: Product
//!   artifacts under `Logs/` and `Ralph_Logs/`. Always written, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` so long-running components report
/// each scan.
///
/// # Example
/// ```bash
/// RUST_LOG=vault=debug vault run processor
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
