//! rho control-plane CLI — a lightweight sibling process to the worker.
//!
//! Never holds the worker lease itself; it only writes the check-trigger
//! file (C3) and reads the worker's persisted state/queue/job files as
//! best-effort snapshots for `status`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rho_bridge_core::jobs::{self, JobStatus};
use rho_bridge_core::lease;
use rho_bridge_core::queue::{self, PendingInbound, PendingOutbound};
use rho_bridge_core::runtime_state;
use rho_bridge_core::trigger::{self, CheckTriggerRequest, RequesterRole};
use rho_bridge_core::DataPaths;

/// rho control-plane CLI
#[derive(Parser)]
#[command(name = "rho-control")]
struct Args {
    /// Override the bridge's data root (defaults to `~/.rho/telegram`)
    #[arg(long)]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the worker to poll Telegram immediately, bypassing its long-poll wait.
    Trigger {
        /// Free-text origin recorded in the request, shown back by `status`.
        #[arg(long, default_value = "control-plane")]
        source: String,
    },
    /// Print a best-effort snapshot of the worker's persisted state.
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let root = args.data_root.unwrap_or_else(DataPaths::default_root);
    let paths = DataPaths::new(root);

    match args.command {
        Command::Trigger { source } => trigger_poll(&paths, source),
        Command::Status => print_status(&paths),
    }
}

fn trigger_poll(paths: &DataPaths, source: String) -> Result<()> {
    let request = CheckTriggerRequest {
        version: 1,
        requested_at: lease::now_ms(),
        requester_pid: std::process::id(),
        requester_role: RequesterRole::Leader,
        source,
    };
    trigger::request(&paths.check_trigger(), &request).context("writing check-trigger request")?;
    tracing::info!("check-trigger request posted");
    println!("check-trigger request posted; the worker will pick it up on its next tick.");
    Ok(())
}

fn print_status(paths: &DataPaths) -> Result<()> {
    let state = runtime_state::load(&paths.state());
    println!("mode: {}", state.mode);
    println!("last_update_id: {}", state.last_update_id);
    println!("last_poll_at: {}", state.last_poll_at.as_deref().unwrap_or("never"));
    println!("consecutive_failures: {}", state.consecutive_failures);
    if let Some(at) = state.last_check_triggered_at {
        println!("last_check_triggered_at: {at} (source: {})", state.last_check_source.as_deref().unwrap_or("?"));
    }

    match lease::read_owner(&paths.worker_lock()) {
        Ok(Some(owner)) => {
            let now = lease::now_ms();
            let stale = now - owner.refreshed_at > 90_000;
            println!(
                "worker lease: held by pid {} on {} (refreshed {}ms ago{})",
                owner.pid,
                owner.hostname,
                now - owner.refreshed_at,
                if stale { ", STALE" } else { "" }
            );
        }
        Ok(None) => println!("worker lease: unheld"),
        Err(e) => println!("worker lease: unreadable ({e})"),
    }

    let inbound = queue::load_validated::<PendingInbound>(&paths.inbound_queue(), queue::is_valid_inbound);
    let outbound = queue::load_validated::<PendingOutbound>(&paths.outbound_queue(), queue::is_valid_outbound);
    println!("inbound queue depth: {}", inbound.len());
    println!("outbound queue depth: {}", outbound.len());

    let jobs = jobs::load(&paths.jobs());
    let running = jobs.iter().filter(|j| j.status == JobStatus::Running).count();
    let queued = jobs.iter().filter(|j| j.status == JobStatus::Queued).count();
    println!("jobs: {running} running, {queued} queued, {} total", jobs.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_trigger_with_default_source() {
        let args = Args::parse_from(["rho-control", "trigger"]);
        match args.command {
            Command::Trigger { source } => assert_eq!(source, "control-plane"),
            _ => panic!("expected Trigger"),
        }
    }

    #[test]
    fn args_parse_trigger_with_custom_source() {
        let args = Args::parse_from(["rho-control", "trigger", "--source", "cron"]);
        match args.command {
            Command::Trigger { source } => assert_eq!(source, "cron"),
            _ => panic!("expected Trigger"),
        }
    }

    #[test]
    fn args_parse_status() {
        let args = Args::parse_from(["rho-control", "status"]);
        assert!(matches!(args.command, Command::Status));
    }

    #[test]
    fn args_parse_data_root_override() {
        let args = Args::parse_from(["rho-control", "--data-root", "/tmp/rho-test", "status"]);
        assert_eq!(args.data_root, Some(PathBuf::from("/tmp/rho-test")));
    }
}
