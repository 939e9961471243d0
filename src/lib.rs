pub mod config;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod worker;

pub use error::SchedulerError;
pub use scheduler::{AdmissionPolicy, AdmissionScheduler, ModelQuotaConfig, Reservation};
