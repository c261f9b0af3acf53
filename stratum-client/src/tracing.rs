//! Provide tracing, tailored to this program.
//!
//! Binaries call one of the init_* functions at startup to install a tracing
//! subscriber (i.e., something that emits events to a log). Library code only
//! emits events and never installs a subscriber itself.
//!
//! The rest of the crate can include `use crate::tracing::prelude::*` for
//! convenient access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and
//! `error!()` macros.
//!
//! Raw protocol lines are traced under the [`WIRE`] target, so a pool
//! conversation can be dumped without the rest of the crate's trace output:
//!
//! ```text
//! RUST_LOG=info,stratum_client::wire=trace stratum-watch
//! ```

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Target of the per-line `rx`/`tx` events.
pub const WIRE: &str = "stratum_client::wire";

/// Name journald records for this crate's binaries.
const SYSLOG_IDENTIFIER: &str = "stratum-client";

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            let layer = layer.with_syslog_identifier(SYSLOG_IDENTIFIER.to_string());
            tracing_subscriber::registry().with(layer).init();
        } else {
            use_stdout(LevelFilter::INFO);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(LevelFilter::INFO);
    }
}

/// Initialize stdout logging for tests, tolerating repeated calls.
///
/// Defaults to WARN so passing tests stay quiet; set RUST_LOG to see the
/// pool conversation (`RUST_LOG=stratum_client::wire=trace`).
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(env_filter(LevelFilter::WARN))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// Log to stdout, filtering according to environment variable RUST_LOG,
// overriding the default level (ERROR) with `default_level`.
fn use_stdout(default_level: LevelFilter) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

fn env_filter(default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

// Format timestamps in local time to the nearest second. The default timer
// is UTC and prints a long, ugly string.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
