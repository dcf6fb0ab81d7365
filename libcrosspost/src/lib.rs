//! Crosspost - post distribution and scheduling engine
//!
//! This library provides the core engine for fanning a post out to multiple
//! social platform accounts: drafting and scheduling, per-target dispatch
//! with retries, credential refresh, and analytics re-sampling.

pub mod analytics;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod queue;
pub mod refresh;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod timeparse;
pub mod types;

// Re-export commonly used types
pub use config::{AggregationPolicy, Config};
pub use db::Database;
pub use error::{AdapterError, CrosspostError, Result};
pub use service::{EngineService, NewTarget, PostView};
pub use types::{Account, Post, PostStatus, Target, TargetStatus};
