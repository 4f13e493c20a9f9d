//! Error types for graph decomposition and reconstitution.

use keel_transport::TransportError;
use keel_types::ObjectId;

/// Errors that can occur while storing, loading, or copying a graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A node was reached again while it was still being serialized.
    #[error("cycle detected at node of type {type_name:?}")]
    CyclicGraph {
        /// Type of the node that closes the cycle.
        type_name: String,
    },

    /// A stored record references an id that is not in the source.
    #[error("missing reference {id} (referenced from {parent})")]
    MissingReference { id: ObjectId, parent: ObjectId },

    /// A chunk record does not have the expected shape.
    #[error("corrupt chunk {id}: {reason}")]
    CorruptChunk { id: ObjectId, reason: String },

    /// NaN and infinities have no canonical JSON form.
    #[error("property {property:?} holds a non-finite number")]
    NonFiniteNumber { property: String },

    /// A map value has the `{"ref": "<id>"}` shape reserved for references.
    #[error("property {property:?} holds a map shaped like a reference marker")]
    ReservedShape { property: String },

    /// The operation observed its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// A payload could not be parsed.
    #[error("serialization error in {id}: {reason}")]
    Serialization { id: ObjectId, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl GraphError {
    /// Corrupt data and malformed graphs are never worth retrying.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_fatal(),
            Self::Cancelled => false,
            _ => true,
        }
    }
}

/// Convenience alias for graph results.
pub type GraphResult<T> = Result<T, GraphError>;
