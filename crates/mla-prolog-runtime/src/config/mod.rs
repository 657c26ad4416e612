/// Pipeline config module.
pub mod pipeline;
/// Planner config module.
pub mod planner;

mod base;
mod logger;

pub use base::*;
pub use logger::{LogCrateLevel, LogLevel, Logger, LoggerConfig};
