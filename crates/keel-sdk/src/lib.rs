//! High-level API for Keel.
//!
//! [`Operations`] sends object graphs to any number of transports and
//! receives them back through a local cache. This is the main entry point
//! for applications embedding Keel.

pub mod error;
pub mod operations;

pub use error::{SdkError, SdkResult};
pub use operations::Operations;

// Re-export key types
pub use keel_crypto::ContentHasher;
pub use keel_graph::{ClosureCopier, DescriptorRegistry, Node, PropertyRole, TypeDescriptor, Value};
pub use keel_transport::{
    CancelSignal, DiskTransport, MemoryTransport, ObjectStoreTransport, SqliteTransport, Transport,
    TransportConfig, TransportHooks,
};
pub use keel_types::{ObjectId, Record};
