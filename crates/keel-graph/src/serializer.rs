//! Graph decomposition.
//!
//! [`decompose`] walks a node depth-first and emits one record per detached
//! node and per chunk, children before parents. Properties are visited in
//! name order, detached values are replaced by `{"ref": id}` markers, and a
//! node's id is the hash of its canonical payload (without the `id` field,
//! which is added afterwards).
//!
//! Every record that references other records also carries a closure table
//! mapping each descendant id to the minimum depth at which it is reachable,
//! plus the size of that table as `totalChildrenCount`.

use std::collections::{BTreeMap, HashMap, HashSet};

use keel_crypto::{canonical_json, ContentHasher};
use keel_transport::CancelSignal;
use keel_types::wire::{
    as_reference, reference_marker, CHUNK_DATA_FIELD, CHUNK_TYPE, CLOSURE_FIELD, ID_FIELD, TOTAL_CHILDREN_FIELD,
    TYPE_FIELD,
};
use keel_types::{ObjectId, Record};
use serde_json::{Map, Number, Value as Json};
use tracing::debug;

use crate::descriptor::{DescriptorRegistry, PropertyRole};
use crate::error::{GraphError, GraphResult};
use crate::node::{Node, Value};

/// Descendant id -> minimum depth (direct children are at depth 1).
pub type Closure = BTreeMap<ObjectId, u32>;

/// One emitted record and the ids its payload references directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecomposedRecord {
    pub record: Record,
    pub references: Vec<ObjectId>,
}

/// Result of decomposing a graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decomposition {
    pub root_id: ObjectId,
    /// Records in post-order: every record after everything it references.
    pub records: Vec<DecomposedRecord>,
}

impl Decomposition {
    /// The root's record.
    pub fn root(&self) -> Option<&Record> {
        self.records.last().map(|r| &r.record)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.records.iter().map(|r| &r.record.id)
    }
}

/// How nodes found inside a property value are written.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Inline,
    Detach,
}

struct Serializer<'a> {
    registry: &'a DescriptorRegistry,
    cancel: Option<&'a CancelSignal>,
    hasher: ContentHasher,
    /// Detached nodes already emitted, by identity.
    done: HashMap<usize, (ObjectId, Closure)>,
    /// Nodes on the current path, by identity.
    on_path: HashSet<usize>,
    emitted: HashSet<ObjectId>,
    records: Vec<DecomposedRecord>,
}

/// Decompose `root` into records.
pub fn decompose(
    root: &Node,
    registry: &DescriptorRegistry,
    cancel: Option<&CancelSignal>,
) -> GraphResult<Decomposition> {
    let mut serializer = Serializer {
        registry,
        cancel,
        hasher: ContentHasher::NODE,
        done: HashMap::new(),
        on_path: HashSet::new(),
        emitted: HashSet::new(),
        records: Vec::new(),
    };
    let (root_id, closure) = serializer.detach(root)?;
    debug!(
        root = %root_id,
        records = serializer.records.len(),
        closure = closure.len(),
        "graph decomposed"
    );
    Ok(Decomposition {
        root_id,
        records: serializer.records,
    })
}

impl Serializer<'_> {
    fn check_cancelled(&self) -> GraphResult<()> {
        match self.cancel {
            Some(cancel) if cancel.is_cancelled() => Err(GraphError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Emit `node` as its own record.
    fn detach(&mut self, node: &Node) -> GraphResult<(ObjectId, Closure)> {
        if let Some(done) = self.done.get(&node.identity()) {
            return Ok(done.clone());
        }
        self.check_cancelled()?;
        let mut closure = Closure::new();
        let body = self.body(node, &mut closure)?;
        let id = self.emit(body, &closure);
        node.assign_id(id.clone());
        self.done.insert(node.identity(), (id.clone(), closure.clone()));
        Ok((id, closure))
    }

    /// Type field plus persisted properties of `node`. Detached descendants
    /// are emitted and added to `closure`.
    fn body(&mut self, node: &Node, closure: &mut Closure) -> GraphResult<Map<String, Json>> {
        if !self.on_path.insert(node.identity()) {
            return Err(GraphError::CyclicGraph {
                type_name: node.type_name().to_string(),
            });
        }
        let descriptor = self.registry.resolve(node.type_name());
        let mut body = Map::new();
        body.insert(TYPE_FIELD.to_string(), Json::String(node.type_name().to_string()));
        for (name, value) in node.properties() {
            let json = match descriptor.role_of(&name) {
                PropertyRole::Ignored => continue,
                PropertyRole::Inline => self.convert(&name, &value, Mode::Inline, closure)?,
                PropertyRole::Detached => self.convert(&name, &value, Mode::Detach, closure)?,
                PropertyRole::Chunked(size) => match &value {
                    Value::List(items) => self.chunk(&name, items, size, closure)?,
                    other => self.convert(&name, other, Mode::Detach, closure)?,
                },
            };
            body.insert(name, json);
        }
        self.on_path.remove(&node.identity());
        Ok(body)
    }

    fn convert(&mut self, property: &str, value: &Value, mode: Mode, closure: &mut Closure) -> GraphResult<Json> {
        Ok(match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::Number((*n).into()),
            Value::Float(x) => Json::Number(Number::from_f64(*x).ok_or_else(|| {
                GraphError::NonFiniteNumber {
                    property: property.to_string(),
                }
            })?),
            Value::String(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(|item| self.convert(property, item, mode, closure))
                    .collect::<GraphResult<_>>()?,
            ),
            Value::Map(entries) => {
                let mut map = Map::new();
                for (key, item) in entries {
                    map.insert(key.clone(), self.convert(property, item, mode, closure)?);
                }
                let map = Json::Object(map);
                if as_reference(&map).is_some() {
                    return Err(GraphError::ReservedShape {
                        property: property.to_string(),
                    });
                }
                map
            }
            Value::Reference(id) => {
                merge_child(closure, id, &Closure::new());
                reference_marker(id)
            }
            Value::Node(node) => match mode {
                Mode::Detach => {
                    let (id, child_closure) = self.detach(node)?;
                    merge_child(closure, &id, &child_closure);
                    reference_marker(&id)
                }
                Mode::Inline => Json::Object(self.body(node, closure)?),
            },
        })
    }

    /// Split `items` into chunk records; the property becomes the ordered
    /// list of chunk references.
    fn chunk(&mut self, property: &str, items: &[Value], size: usize, closure: &mut Closure) -> GraphResult<Json> {
        let mut refs = Vec::with_capacity(items.len().div_ceil(size.max(1)));
        for slice in items.chunks(size.max(1)) {
            self.check_cancelled()?;
            let mut chunk_closure = Closure::new();
            let data = slice
                .iter()
                .map(|item| self.convert(property, item, Mode::Detach, &mut chunk_closure))
                .collect::<GraphResult<Vec<_>>>()?;
            let mut body = Map::new();
            body.insert(TYPE_FIELD.to_string(), Json::String(CHUNK_TYPE.to_string()));
            body.insert(CHUNK_DATA_FIELD.to_string(), Json::Array(data));
            let id = self.emit(body, &chunk_closure);
            merge_child(closure, &id, &chunk_closure);
            refs.push(reference_marker(&id));
        }
        Ok(Json::Array(refs))
    }

    /// Finish a record body: closure fields, hash, id field. Identical
    /// records are emitted once.
    fn emit(&mut self, mut body: Map<String, Json>, closure: &Closure) -> ObjectId {
        let references: Vec<ObjectId> = keel_types::wire::references(&Json::Object(body.clone()));
        if !closure.is_empty() {
            let table: Map<String, Json> = closure
                .iter()
                .map(|(id, depth)| (id.to_string(), Json::Number((*depth).into())))
                .collect();
            body.insert(CLOSURE_FIELD.to_string(), Json::Object(table));
            body.insert(TOTAL_CHILDREN_FIELD.to_string(), Json::Number(closure.len().into()));
        }
        let mut value = Json::Object(body);
        let id = self.hasher.hash_json(&value);
        if let Json::Object(map) = &mut value {
            map.insert(ID_FIELD.to_string(), Json::String(id.to_string()));
        }
        if self.emitted.insert(id.clone()) {
            self.records.push(DecomposedRecord {
                record: Record::new(id.clone(), canonical_json(&value)),
                references,
            });
        }
        id
    }
}

/// Add a direct child and its closure (one level deeper) to `closure`.
fn merge_child(closure: &mut Closure, child: &ObjectId, child_closure: &Closure) {
    lower(closure, child, 1);
    for (id, depth) in child_closure {
        lower(closure, id, depth + 1);
    }
}

fn lower(closure: &mut Closure, id: &ObjectId, depth: u32) {
    closure
        .entry(id.clone())
        .and_modify(|d| *d = (*d).min(depth))
        .or_insert(depth);
}
