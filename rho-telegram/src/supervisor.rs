//! Supervisor (C14): acquires the single-writer worker lease, then drives
//! the runtime's poll/drain/flush/job-pump cycle until signalled to stop.
//!
//! There is intentionally no retry-with-jitter scheduling here beyond a
//! flat idle backoff — `poll_once`'s long-poll against Telegram already
//! provides the waiting, so a failed poll just gets a short pause before
//! the next attempt rather than hammering the API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rho_bridge_core::lease;
use rho_bridge_core::rpc::RpcRuntime;
use rho_bridge_core::{DataPaths, Settings};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{info, warn};

use crate::client::TelegramClient;
use crate::worker::WorkerRuntime;

const IDLE_BACKOFF_MS: u64 = 1000;

/// Run the worker until SIGINT/SIGTERM or the lease is lost.
pub async fn run<C: TelegramClient + 'static>(
    worker: Arc<WorkerRuntime<C>>,
    rpc: Arc<RpcRuntime>,
    settings: &Settings,
    paths: &DataPaths,
) -> Result<()> {
    let nonce = uuid::Uuid::new_v4().to_string();
    let now = lease::now_ms();
    let outcome = lease::try_acquire(&paths.worker_lock(), nonce, now, settings.lock_stale_ms, "worker")
        .context("acquiring worker lease")?;
    let Some(handle) = outcome.lease else {
        bail!("worker lease already held by pid {:?}", outcome.owner_pid);
    };
    info!("worker lease acquired");

    let mut sigterm = unix_signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let refresh_ms = settings.lock_refresh_ms.max(1000) as u64;
    let mut refresh_ticker = tokio::time::interval(Duration::from_millis(refresh_ms));
    refresh_ticker.tick().await; // consume the immediate first tick

    let mut last_seen_mtime_ms = 0i64;
    let mut lease_lost: Option<String> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = refresh_ticker.tick() => {
                match handle.refresh(lease::now_ms()) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("worker lease lost to another process, shutting down");
                        lease_lost = Some("worker lease lost to another process".to_string());
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to refresh worker lease, shutting down");
                        lease_lost = Some(format!("failed to refresh worker lease: {e}"));
                        break;
                    }
                }
            }
            poll_ok = run_cycle(&worker, &mut last_seen_mtime_ms) => {
                if !poll_ok {
                    tokio::time::sleep(Duration::from_millis(IDLE_BACKOFF_MS)).await;
                }
            }
        }
    }

    if let Err(e) = worker.flush_outbound_queue().await {
        warn!(error = %e, "final outbound flush failed");
    }
    rpc.dispose().await;

    // Only release the lease on a clean shutdown — if another process
    // already stole it, releasing here would tear down its lease instead.
    if lease_lost.is_none() {
        let _ = lease::release(&handle);
    }

    if let Some(reason) = lease_lost {
        bail!(reason);
    }

    info!("worker shut down cleanly");
    Ok(())
}

/// One supervised cycle: a full worker tick plus a check-trigger sweep.
/// Returns whether the poll step succeeded, used by the caller to decide
/// whether to back off before the next cycle.
async fn run_cycle<C: TelegramClient>(worker: &WorkerRuntime<C>, last_seen_mtime_ms: &mut i64) -> bool {
    let poll_ok = worker.tick().await;
    match worker.handle_check_trigger(*last_seen_mtime_ms).await {
        Ok(next_seen) => *last_seen_mtime_ms = next_seen,
        Err(e) => warn!(error = %e, "handle_check_trigger failed"),
    }
    poll_ok
}
