//! Vault pipeline
//!
//! Durable file-operation event queue for tracked vault directories. Every
//! accepted operation is applied to disk by a per-root worker, recorded in the
//! metadata store, and folded into batched git commits.

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod jobs;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod status;
pub mod vcs;
pub mod watcher;
pub mod worker;

pub use config::PipelineConfig;
pub use context::AppContext;
pub use error::{PipelineError, PipelineResult};
