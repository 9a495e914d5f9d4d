//! REST control plane for the cronwork scheduler.
//!
//! Thin warp HTTP layer over the repository, scheduler, and response cache.
//! The binary in `main.rs` is the composition root: it connects the store,
//! runs migrations, starts the scheduling engine, and serves the API.

pub mod api;
pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::Server;

pub type Result<T> = std::result::Result<T, anyhow::Error>;
