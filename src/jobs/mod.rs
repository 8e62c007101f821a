//! Background jobs
//!
//! The job kinds, their shared configuration, the status registry and the
//! manager that schedules them.

mod config;
mod kind;
pub mod manager;
pub mod registry;
pub mod runner;

pub use config::{JobConfig, SharedConfig};
pub use kind::JobKind;
pub use manager::JobManager;
pub use registry::JobRegistry;
pub use runner::{EscrowJobs, JobExecutor, JobReport};
