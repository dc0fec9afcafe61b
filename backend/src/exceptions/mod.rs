//! Exception lifecycle: store, state machine, coverage lookup.

pub mod lookup;
pub mod service;
pub mod store;

pub use service::{CreateExceptionRequest, ExceptionService};
pub use store::{ExceptionStore, NewException, ReminderRow, StoreError};
