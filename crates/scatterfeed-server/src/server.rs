//! Server internals for both roles of the chunk protocol.
//!
//! ## Structure
//!
//! - [`config`] - CLI and environment configuration.
//! - [`dataset`] - The record partition a worker serves.
//! - [`streaming`] - Session and correlation state plus the scatter-gather
//!   coordinator.
//! - [`pool`] - The ordered set of backend workers a leader calls.
//! - [`service`] - gRPC service implementations and their housekeeping.
//! - [`telemetry`] - Logging, tracing and metrics setup.

pub mod config;
pub mod dataset;
pub mod pool;
pub mod service;
pub mod streaming;
pub mod telemetry;
