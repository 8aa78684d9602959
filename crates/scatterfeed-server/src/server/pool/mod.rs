//! Backend workers addressed by a leader.
//!
//! - [`backend`] - The [`ChunkBackend`](backend::ChunkBackend) seam and its
//!   gRPC implementation.
//! - [`manager`] - The ordered [`WorkerPool`](manager::WorkerPool) and its
//!   concurrent fan-out.

pub mod backend;
pub mod manager;
