//! Schedule evaluation and the reconciliation loop.

pub mod evaluator;
pub mod service;

pub use evaluator::desired_schedules;
pub use service::{ReconcilerConfig, ReconciliationService, TickReport};
