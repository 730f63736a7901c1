//! Core library for the rho Telegram ↔ agent bridge.
//!
//! Provides the components that make up the "hard part" of a
//! single-tenant Telegram bridge worker: a file-based lease, crash-safe
//! queues, the subprocess RPC runtime, the outbound chunker and retry
//! policy, and the background job scheduler. Everything here is plain
//! data and pure/async logic; wiring to a concrete Telegram client lives
//! in the `rho-telegram` binary crate.

pub mod approvals;
pub mod atomic_io;
pub mod chunker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod paths;
pub mod queue;
pub mod retry;
pub mod rpc;
pub mod runtime_state;
pub mod session_map;
pub mod slash;
pub mod stt;
pub mod text;
pub mod trigger;
pub mod tts;

pub use config::Settings;
pub use error::{BridgeError, Result};
pub use paths::DataPaths;
