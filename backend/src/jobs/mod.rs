// Background jobs for the exception lifecycle

pub mod expiry_sweep;
pub mod reminder_sweep;
pub mod scheduler;

pub use expiry_sweep::ExpirySweepJob;
pub use reminder_sweep::{ReminderSweepJob, ReminderSweepResult};
pub use scheduler::{JobError, JobResult, JobScheduler};
