use std::time::Duration;

use keel_types::ObjectId;

/// Boxed backend error carried as the source of transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A record was required but the transport does not have it.
    #[error("{transport}: object not found: {id}")]
    NotFound { transport: String, id: ObjectId },

    /// The backend rejected a write. `durable` lists the ids that were
    /// already written before the failure so the caller can resume.
    #[error("{transport}: write failed ({} records already durable): {source}", .durable.len())]
    Write {
        transport: String,
        durable: Vec<ObjectId>,
        source: BoxError,
    },

    /// `save_object_from` was asked to copy an id the source does not have.
    #[error("cannot copy {id} from {source_transport} to {transport}: source does not have it")]
    Source {
        transport: String,
        source_transport: String,
        id: ObjectId,
    },

    /// The backend failed while reading.
    #[error("{transport}: read of {id} failed: {source}")]
    Read {
        transport: String,
        id: ObjectId,
        source: BoxError,
    },

    /// `write_complete` gave up waiting. Writes may still be in flight.
    #[error("{transport}: writes not complete after {waited:?} ({pending} pending)")]
    Timeout {
        transport: String,
        waited: Duration,
        pending: usize,
    },

    /// The operation observed its cancellation signal. Records listed in
    /// `completed` are durable and stay durable.
    #[error("{transport}: operation cancelled after {} records", .completed.len())]
    Cancelled {
        transport: String,
        completed: Vec<ObjectId>,
    },

    /// A stored record is malformed (id mismatch, bad encoding). Fatal.
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: ObjectId, reason: String },

    /// The id cannot be used as a key by this backend.
    #[error("{transport}: invalid id {id:?}: {reason}")]
    InvalidId {
        transport: String,
        id: String,
        reason: &'static str,
    },

    /// The transport could not be opened or initialized.
    #[error("{transport}: initialization failed: {source}")]
    Open { transport: String, source: BoxError },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Wrap a backend error as a write failure with no durable records.
    pub fn write(transport: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Write {
            transport: transport.into(),
            durable: Vec::new(),
            source: source.into(),
        }
    }

    /// Wrap a backend error as a read failure.
    pub fn read(transport: impl Into<String>, id: &ObjectId, source: impl Into<BoxError>) -> Self {
        Self::Read {
            transport: transport.into(),
            id: id.clone(),
            source: source.into(),
        }
    }

    /// Prepend `earlier` to the durable / completed ids carried by this error.
    ///
    /// Bulk operations use this to report everything written before the
    /// failing step, not only what the failing call itself managed.
    pub fn with_durable(mut self, earlier: &[ObjectId]) -> Self {
        match &mut self {
            Self::Write { durable, .. } => prepend(durable, earlier),
            Self::Cancelled { completed, .. } => prepend(completed, earlier),
            _ => {}
        }
        self
    }

    /// Ids known to be durable when this error was raised.
    pub fn durable_ids(&self) -> &[ObjectId] {
        match self {
            Self::Write { durable, .. } => durable,
            Self::Cancelled { completed, .. } => completed,
            _ => &[],
        }
    }

    /// Fatal errors must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CorruptRecord { .. } | Self::InvalidId { .. } | Self::Config(_) | Self::Source { .. }
        )
    }

    /// Timeouts, reads, and write failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Read { .. } | Self::Write { .. })
    }
}

fn prepend(ids: &mut Vec<ObjectId>, earlier: &[ObjectId]) {
    if earlier.is_empty() {
        return;
    }
    let mut merged = earlier.to_vec();
    merged.append(ids);
    *ids = merged;
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    #[test]
    fn with_durable_prepends_earlier_ids() {
        let err = TransportError::Write {
            transport: "t".into(),
            durable: vec![oid("c")],
            source: "disk full".into(),
        }
        .with_durable(&[oid("a"), oid("b")]);
        assert_eq!(err.durable_ids(), &[oid("a"), oid("b"), oid("c")]);
    }

    #[test]
    fn with_durable_ignores_other_variants() {
        let err = TransportError::NotFound {
            transport: "t".into(),
            id: oid("x"),
        }
        .with_durable(&[oid("a")]);
        assert!(err.durable_ids().is_empty());
    }

    #[test]
    fn classification() {
        let corrupt = TransportError::CorruptRecord {
            id: oid("x"),
            reason: "id mismatch".into(),
        };
        assert!(corrupt.is_fatal());
        assert!(!corrupt.is_retryable());

        let timeout = TransportError::Timeout {
            transport: "t".into(),
            waited: Duration::from_secs(1),
            pending: 3,
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn write_error_display_counts_durable() {
        let err = TransportError::write("Disk", "permission denied").with_durable(&[oid("a")]);
        assert_eq!(
            err.to_string(),
            "Disk: write failed (1 records already durable): permission denied"
        );
    }
}
