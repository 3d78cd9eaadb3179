//! # tidewire-session
//!
//! Connection-level machinery on top of `tidewire-protocol`.
//!
//! This crate provides:
//! - Reassembly of chunked messages with optional idle eviction
//! - Request/response correlation with timeout cancellation
//! - Command dispatch to registered handlers
//! - An [`Endpoint`] tying these to a pluggable [`Transport`]
//! - YAML/env configuration

pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod pending;
pub mod reassembly;

pub use config::{Config, ConfigError};
pub use dispatch::{DispatchOutcome, Dispatcher, FrameHandler};
pub use endpoint::{Endpoint, EndpointStats, Transport};
pub use error::SessionError;
pub use pending::{PendingRequestTable, PendingResponse, PendingStats, RequestOutcome};
pub use reassembly::{ChunkReassembler, ReassemblyKey, ReassemblyStats, SweeperHandle};

/// Identifies one transport connection.
///
/// Assigned by the transport; only equality matters to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(pub u64);

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
