//! Connect to a pool and log the jobs it hands out.
//!
//! Configuration comes from `STRATUM_*` environment variables; see
//! [`stratum_client::config::Config::from_env`]. Runs until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use stratum_client::config::Config;
use stratum_client::stratum::{Response, Session, Work};
use stratum_client::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::from_env().context("reading configuration")?;
    let session = Session::new(config.session.session_config());

    let (work_tx, work_rx) = mpsc::channel(16);
    let (response_tx, response_rx) = mpsc::channel(16);
    session.register_work_listener(work_tx);
    session.register_response_listener(response_tx);

    session
        .connect(&config.pool.url)
        .await
        .with_context(|| format!("connecting to {}", config.pool.url))?;
    session
        .authorize(&config.pool.user, &config.pool.password)
        .await
        .context("authorizing with pool")?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(log_work(work_rx, running.clone()));
    tracker.spawn(log_responses(response_rx, running.clone()));
    tracker.close();
    info!(pool = %config.pool.url, "Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();
    session.shutdown().await;

    tracker.wait().await;
    let stats = session.stats().await;
    info!(
        accepted = stats.accepted,
        submitted = stats.submitted,
        unanswered = stats.unanswered,
        "Exiting."
    );
    Ok(())
}

async fn log_work(mut work_rx: mpsc::Receiver<Arc<Work>>, running: CancellationToken) {
    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            work = work_rx.recv() => match work {
                Some(work) => info!(
                    job_id = work.job_id(),
                    size = work.size(),
                    target = %format_args!("{:#018x}", work.target()),
                    difficulty = %format_args!("{:.2}", work.difficulty()),
                    "Job"
                ),
                None => break,
            },
        }
    }
}

async fn log_responses(mut response_rx: mpsc::Receiver<Response>, running: CancellationToken) {
    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            response = response_rx.recv() => match response {
                Some(response) => debug!(response = %response, "Pool response"),
                None => break,
            },
        }
    }
}
