pub mod attention;
mod config;
pub mod noise;
pub mod pipelines;
pub mod schedulers;

pub use attention::{attention, AttentionError};
pub use config::{ConfigError, DdimConfig, Precision};
pub use schedulers::{Ddim, SchedulerError, StepIndex};
