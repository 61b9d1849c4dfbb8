//! Shared Document Synchronization
//!
//! This crate keeps replicated CAD documents in sync between peers:
//! - Codec: lib0-style variable-length encoding
//! - Protocol: sync step and awareness message framing
//! - Doc: the replicated document seam and a grow-only reference replica
//! - Transport: one document bound to one message channel
//! - Registry: documents per kernel process and channel

pub mod awareness;
pub mod codec;
pub mod config;
pub mod doc;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use awareness::*;
pub use codec::*;
pub use config::*;
pub use doc::*;
pub use protocol::*;
pub use registry::*;
pub use transport::*;
