//! Chunked delivery state for both roles.
//!
//! - [`session`] - Worker-side pagination sessions over immutable record
//!   snapshots.
//! - [`correlation`] - Leader-side mapping from one request id to the worker
//!   sessions behind it.
//! - [`coordinator`] - The leader's initiate / continue / cancel protocol.
//! - [`cache`] - The leader's optional cache of finished query results.

pub mod cache;
pub mod coordinator;
pub mod correlation;
pub mod session;

#[cfg(test)]
mod tests;
