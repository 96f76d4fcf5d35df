//! Configuration parsing for Foreman.
//!
//! Scheduler and node configuration is written in KDL.

pub mod error;
pub mod scheduler;

pub use error::{ConfigError, ConfigResult};
pub use scheduler::{NodeConfig, SchedulerConfig, parse_scheduler_config};
