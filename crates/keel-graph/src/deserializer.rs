//! Graph reconstitution.
//!
//! Loading runs in two phases. First every record reachable from the root
//! is fetched breadth-first, one level at a time with bounded concurrency.
//! Then nodes are materialized bottom-up from the fetched payloads: each
//! record id yields exactly one [`Node`], so shared children stay shared,
//! and chunk references inside a list are replaced by the chunk contents.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::stream::{self, StreamExt, TryStreamExt};
use keel_transport::{CancelSignal, Transport};
use keel_types::wire::{
    as_reference, references, type_of, CHUNK_DATA_FIELD, CHUNK_TYPE, CLOSURE_FIELD, ID_FIELD,
    TOTAL_CHILDREN_FIELD, TYPE_FIELD,
};
use keel_types::ObjectId;
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::error::{GraphError, GraphResult};
use crate::node::{Node, Value};

/// Concurrent reads per breadth-first level.
const FETCH_CONCURRENCY: usize = 32;

/// Type given to stored objects that carry no type field.
const UNTYPED: &str = "Base";

/// Load the graph rooted at `root` from `source`.
pub async fn load(root: &ObjectId, source: &dyn Transport, cancel: Option<&CancelSignal>) -> GraphResult<Node> {
    let payloads = fetch_closure(root, source, cancel).await?;
    let mut materializer = Materializer {
        payloads: &payloads,
        built: HashMap::new(),
        building: HashSet::new(),
    };
    let node = materializer.node(root, root)?;
    debug!(root = %root, records = payloads.len(), "graph loaded");
    Ok(node)
}

async fn fetch_closure(
    root: &ObjectId,
    source: &dyn Transport,
    cancel: Option<&CancelSignal>,
) -> GraphResult<HashMap<ObjectId, Json>> {
    let mut payloads = HashMap::new();
    let mut seen = HashSet::from([root.clone()]);
    let mut frontier = vec![(root.clone(), root.clone())];

    while !frontier.is_empty() {
        if cancel.is_some_and(CancelSignal::is_cancelled) {
            return Err(GraphError::Cancelled);
        }
        let fetched: Vec<(ObjectId, Json)> = stream::iter(frontier)
            .map(|(id, parent)| async move {
                let payload = source.get_object(&id).await?;
                let Some(payload) = payload else {
                    return Err(if id == parent {
                        GraphError::Transport(keel_transport::TransportError::NotFound {
                            transport: source.name().to_string(),
                            id,
                        })
                    } else {
                        GraphError::MissingReference { id, parent }
                    });
                };
                let json: Json = serde_json::from_str(&payload).map_err(|e| GraphError::Serialization {
                    id: id.clone(),
                    reason: e.to_string(),
                })?;
                Ok::<_, GraphError>((id, json))
            })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut next = Vec::new();
        for (id, json) in fetched {
            for child in references(&json) {
                if seen.insert(child.clone()) {
                    next.push((child, id.clone()));
                }
            }
            payloads.insert(id, json);
        }
        frontier = next;
    }
    Ok(payloads)
}

struct Materializer<'a> {
    payloads: &'a HashMap<ObjectId, Json>,
    built: HashMap<ObjectId, Node>,
    building: HashSet<ObjectId>,
}

impl<'a> Materializer<'a> {
    fn payload(&self, id: &ObjectId, parent: &ObjectId) -> GraphResult<&'a Json> {
        self.payloads.get(id).ok_or_else(|| GraphError::MissingReference {
            id: id.clone(),
            parent: parent.clone(),
        })
    }

    /// The node stored under `id`, built once.
    fn node(&mut self, id: &ObjectId, parent: &ObjectId) -> GraphResult<Node> {
        if let Some(node) = self.built.get(id) {
            return Ok(node.clone());
        }
        let json = self.payload(id, parent)?;
        let Some(object) = json.as_object() else {
            return Err(GraphError::Serialization {
                id: id.clone(),
                reason: "payload is not a JSON object".to_string(),
            });
        };
        if !self.building.insert(id.clone()) {
            return Err(GraphError::CyclicGraph {
                type_name: type_of(json).unwrap_or(UNTYPED).to_string(),
            });
        }
        let node = self.object(object, id)?;
        node.assign_id(id.clone());
        self.building.remove(id);
        self.built.insert(id.clone(), node.clone());
        Ok(node)
    }

    /// Build a node from a JSON object (a record body or an inline node).
    fn object(&mut self, object: &Map<String, Json>, owner: &ObjectId) -> GraphResult<Node> {
        let type_name = object.get(TYPE_FIELD).and_then(Json::as_str).unwrap_or(UNTYPED);
        let node = Node::new(type_name);
        for (name, json) in object {
            if matches!(name.as_str(), TYPE_FIELD | ID_FIELD | CLOSURE_FIELD | TOTAL_CHILDREN_FIELD) {
                continue;
            }
            node.set(name.clone(), self.value(json, owner)?);
        }
        Ok(node)
    }

    fn value(&mut self, json: &Json, owner: &ObjectId) -> GraphResult<Value> {
        if let Some(id) = as_reference(json) {
            return Ok(Value::Node(self.node(&id, owner)?));
        }
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::List(self.list(items, owner)?),
            Json::Object(map) if map.contains_key(TYPE_FIELD) => Value::Node(self.object(map, owner)?),
            Json::Object(map) => {
                let mut entries = BTreeMap::new();
                for (key, item) in map {
                    entries.insert(key.clone(), self.value(item, owner)?);
                }
                Value::Map(entries)
            }
        })
    }

    /// List items, with chunk references spliced in place.
    fn list(&mut self, items: &[Json], owner: &ObjectId) -> GraphResult<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let chunk = as_reference(item).filter(|id| {
                self.payloads
                    .get(id)
                    .is_some_and(|p| type_of(p) == Some(CHUNK_TYPE))
            });
            match chunk {
                Some(chunk_id) => {
                    let payload = self.payload(&chunk_id, owner)?;
                    let data = payload
                        .get(CHUNK_DATA_FIELD)
                        .and_then(Json::as_array)
                        .ok_or_else(|| GraphError::CorruptChunk {
                            id: chunk_id.clone(),
                            reason: format!("missing {CHUNK_DATA_FIELD:?} list"),
                        })?;
                    for element in data {
                        out.push(self.value(element, &chunk_id)?);
                    }
                }
                None => out.push(self.value(item, owner)?),
            }
        }
        Ok(out)
    }
}
