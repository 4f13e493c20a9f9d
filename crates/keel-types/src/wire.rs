//! Payload wire format.
//!
//! A payload is a JSON object describing one node. Detached children and
//! chunks are replaced by reference markers of the form `{"ref": "<id>"}`:
//!
//! ```json
//! {"speckle_type":"Point","x":1,"y":2,"detachedChild":{"ref":"a1b2c3"}}
//! ```
//!
//! A JSON object whose only key is `ref` with a string value is always a
//! reference marker. Payloads that are not JSON are opaque leaves.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::object::ObjectId;

/// Field holding a node's type discriminator.
pub const TYPE_FIELD: &str = "speckle_type";
/// Field holding a node's own id (added after hashing).
pub const ID_FIELD: &str = "id";
/// Key of a reference marker.
pub const REF_FIELD: &str = "ref";
/// Field holding the closure table: child id -> minimum depth.
pub const CLOSURE_FIELD: &str = "__closure";
/// Field holding the number of records in the closure.
pub const TOTAL_CHILDREN_FIELD: &str = "totalChildrenCount";
/// Type discriminator of chunk records.
pub const CHUNK_TYPE: &str = "DataChunk";
/// Field of a chunk record holding its slice of the original list.
pub const CHUNK_DATA_FIELD: &str = "data";

/// Build a reference marker pointing at `id`.
pub fn reference_marker(id: &ObjectId) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(REF_FIELD.to_string(), Value::String(id.as_str().to_string()));
    Value::Object(map)
}

/// If `value` is a reference marker, return the id it points at.
pub fn as_reference(value: &Value) -> Option<ObjectId> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let id = map.get(REF_FIELD)?.as_str()?;
    ObjectId::new(id).ok()
}

/// All distinct ids referenced from `value`, in document order.
///
/// The closure table is skipped: it lists every descendant, not just the
/// direct references of this record.
pub fn references(value: &Value) -> Vec<ObjectId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    collect_references(value, &mut seen, &mut out);
    out
}

fn collect_references(value: &Value, seen: &mut HashSet<ObjectId>, out: &mut Vec<ObjectId>) {
    if let Some(id) = as_reference(value) {
        if seen.insert(id.clone()) {
            out.push(id);
        }
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_references(item, seen, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                if key == CLOSURE_FIELD {
                    continue;
                }
                collect_references(item, seen, out);
            }
        }
        _ => {}
    }
}

/// The closure table embedded in a payload, if it has one.
pub fn closure_table(value: &Value) -> Option<BTreeMap<ObjectId, u32>> {
    let table = value.get(CLOSURE_FIELD)?.as_object()?;
    let mut out = BTreeMap::new();
    for (key, depth) in table {
        let id = ObjectId::new(key.as_str()).ok()?;
        let depth = u32::try_from(depth.as_u64()?).ok()?;
        out.insert(id, depth);
    }
    Some(out)
}

/// The `id` field embedded in a payload, if it is a JSON object with one.
pub fn embedded_id(value: &Value) -> Option<ObjectId> {
    let id = value.get(ID_FIELD)?.as_str()?;
    ObjectId::new(id).ok()
}

/// The type discriminator of a payload, if present.
pub fn type_of(value: &Value) -> Option<&str> {
    value.get(TYPE_FIELD)?.as_str()
}
