//! In-memory object graph.
//!
//! A [`Node`] is a shared handle: cloning it yields another handle to the same
//! node, and two handles compare equal only when they point at the same node.
//! Properties live behind a lock so a graph can be assembled from several
//! places before it is stored.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use keel_types::ObjectId;

/// A property value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Node(Node),
    /// Reference to a record that is already stored somewhere.
    Reference(ObjectId),
}

impl Value {
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Self::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Node> for Value {
    fn from(v: Node) -> Self {
        Self::Node(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Self::Reference(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

struct NodeInner {
    type_name: String,
    id: RwLock<Option<ObjectId>>,
    properties: RwLock<BTreeMap<String, Value>>,
}

/// A node of the object graph: a type discriminator plus named properties.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl Node {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self(Arc::new(NodeInner {
            type_name: type_name.into(),
            id: RwLock::new(None),
            properties: RwLock::new(BTreeMap::new()),
        }))
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    /// Id from the last time this node was stored, loaded, or hashed.
    pub fn id(&self) -> Option<ObjectId> {
        self.0.id.read().expect("lock poisoned").clone()
    }

    pub(crate) fn assign_id(&self, id: ObjectId) {
        *self.0.id.write().expect("lock poisoned") = Some(id);
    }

    /// Set a property, returning the previous value.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0
            .properties
            .write()
            .expect("lock poisoned")
            .insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.properties.read().expect("lock poisoned").get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.properties.write().expect("lock poisoned").remove(name)
    }

    /// Property names in sorted order.
    pub fn property_names(&self) -> Vec<String> {
        self.0.properties.read().expect("lock poisoned").keys().cloned().collect()
    }

    /// Snapshot of all properties.
    pub fn properties(&self) -> BTreeMap<String, Value> {
        self.0.properties.read().expect("lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.0.properties.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if both handles point at the same node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity key, stable for the lifetime of the node.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Property values are left out: graphs may be large or cyclic.
        f.debug_struct("Node")
            .field("type", &self.0.type_name)
            .field("id", &self.id())
            .field("properties", &self.property_names())
            .finish()
    }
}
