//! Background job scheduler and job implementations.

mod expire_exports;
mod scheduler;

pub use expire_exports::ExpireExportsJob;
pub use scheduler::{Job, JobFrequency, JobScheduler};
