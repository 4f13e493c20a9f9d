//! Content hashing for Keel.
//!
//! Provides canonical JSON encoding and domain-separated BLAKE3 hashing. Two
//! producers that serialize the same logical content get the same id on any
//! platform, which is what makes record deduplication work.
//!
//! All crypto operations wrap established libraries.

pub mod canonical;
pub mod hasher;

pub use canonical::canonical_json;
pub use hasher::ContentHasher;
