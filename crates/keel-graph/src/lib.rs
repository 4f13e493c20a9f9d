//! Object graph persistence for Keel.
//!
//! - [`node`]: the in-memory graph ([`Node`], [`Value`])
//! - [`descriptor`]: which properties are inlined, detached, chunked, or ignored
//! - [`serializer`]: decomposition into content-addressed records
//! - [`deserializer`]: reconstitution from any transport
//! - [`copier`]: the [`ClosureCopier`] facade tying them to transports

pub mod copier;
pub mod descriptor;
pub mod deserializer;
pub mod error;
pub mod node;
pub mod serializer;

pub use copier::ClosureCopier;
pub use descriptor::{DescriptorRegistry, PropertyRole, TypeDescriptor, DEFAULT_CHUNK_SIZE};
pub use error::{GraphError, GraphResult};
pub use node::{Node, Value};
pub use serializer::{decompose, Decomposition, DecomposedRecord};
