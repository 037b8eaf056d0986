#![forbid(unsafe_code)]

//! `discodex`: bridge between a chat front-end and a Codex agent process.
//!
//! - [`bridge`]: long-lived `codex mcp` process spoken to over stdio JSON-RPC.
//! - [`tail`]: interactive agent whose replies are read from its session log.
//! - [`runner`]: the [`ChatRunner`](runner::ChatRunner) entry point over both.
//! - [`rpc`]: wire framing, envelopes and process plumbing.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod extract;
pub mod rpc;
pub mod runner;
pub mod tail;
pub mod text;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
