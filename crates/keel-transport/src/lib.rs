//! Pluggable record transports.
//!
//! A transport is an unordered, content-addressed key-value store of
//! [`Record`](keel_types::Record)s behind the async [`Transport`] trait.
//! Four backends are provided:
//!
//! - [`MemoryTransport`]: a `HashMap` behind a lock, for tests and caches
//! - [`DiskTransport`]: one file per record, written atomically
//! - [`SqliteTransport`]: a single-table embedded database
//! - [`ObjectStoreTransport`]: write-behind batching onto S3-compatible storage
//!
//! Closure copy ([`copy_closure`]) moves everything reachable from a root id
//! between any two transports, writing children before parents and skipping
//! whatever the destination already holds.

pub mod bucket;
pub mod config;
pub mod copy;
pub mod disk;
pub mod error;
pub mod hooks;
pub mod memory;
pub mod ordered;
mod queue;
pub mod sqlite;
pub mod traits;

pub use bucket::ObjectStoreTransport;
pub use config::{DiskConfig, FlushConfig, ObjectStoreConfig, SqliteConfig, TransportConfig};
pub use copy::{copy_closure, CopyReport};
pub use disk::DiskTransport;
pub use error::{TransportError, TransportResult};
pub use hooks::{CancelSignal, ErrorFn, ProgressFn, TransportHooks};
pub use memory::MemoryTransport;
pub use ordered::OrderedWriter;
pub use sqlite::SqliteTransport;
pub use traits::{TotalFn, Transport};
