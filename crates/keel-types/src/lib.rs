//! Foundation types for Keel.
//!
//! Every other Keel crate depends on `keel-types`. It defines what a stored
//! record looks like and how references between records are encoded, without
//! knowing anything about hashing or storage backends.
//!
//! # Key Types
//!
//! - [`ObjectId`]: content-derived identifier used as a record's storage key
//! - [`Record`]: the `(id, payload)` pair a transport actually stores
//! - [`wire`]: field names and `{"ref": <id>}` reference markers inside payloads

pub mod error;
pub mod object;
pub mod record;
pub mod wire;

pub use error::TypeError;
pub use object::ObjectId;
pub use record::Record;
