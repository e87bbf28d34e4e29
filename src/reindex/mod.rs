//! Re-index engine: re-evaluate a time range of source records against the
//! current policy set and write replacement activity rows.

pub mod controller;
pub mod worker;

pub use controller::{run_controller, ReconcileContext};
pub use worker::{run_worker, WorkerError, WorkerParams};
