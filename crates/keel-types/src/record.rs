use serde::{Deserialize, Serialize};

use crate::object::ObjectId;

/// The unit a transport stores: an id and its serialized payload.
///
/// Records are immutable once written. The payload is usually a JSON node
/// with `{"ref": <id>}` markers in place of detached children, but transports
/// never interpret it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: ObjectId,
    pub payload: String,
}

impl Record {
    pub fn new(id: ObjectId, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}
