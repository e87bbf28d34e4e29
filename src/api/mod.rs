//! Ephemeral REST harness over the seven query/preview kinds.

pub mod ephemeral;
pub mod scope_extract;
pub mod server;

pub use server::{router, ApiState};
