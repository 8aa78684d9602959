//! Shared protocol, state and error definitions used by both server roles.
//!
//! ## Submodules
//!
//! - [`error`] - Unified error type and its mapping onto `tonic::Status`.
//! - [`types`] - Record and request-id aliases plus configuration defaults.
//! - [`ids`] - Request-id generation capability injected into the stores.
//! - [`expiry`] - Generic expiring map and the periodic reaper task.
//! - [`proto`] - Generated gRPC messages, client and server for the chunk
//!   protocol.

pub mod error;
pub mod expiry;
pub mod ids;
pub mod types;

pub use error::{CloseReason, Error, Result};

pub mod proto {
    tonic::include_proto!("scatterfeed");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("scatterfeed_descriptor");
}
