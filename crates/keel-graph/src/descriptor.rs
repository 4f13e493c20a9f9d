//! Per-type decomposition descriptors.
//!
//! A descriptor says, for each property of a node type, whether the value is
//! stored inline, detached into its own record, split into chunks, or left
//! out entirely. Properties a descriptor does not mention fall back to naming
//! conventions:
//!
//! | name          | role                                  |
//! |---------------|---------------------------------------|
//! | `__cache`     | ignored                               |
//! | `@elements`   | detached                              |
//! | `@(250)verts` | chunked, 250 elements per chunk       |
//! | `@()verts`    | chunked, default chunk size           |
//! | anything else | inline                                |

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use keel_types::wire::{CLOSURE_FIELD, ID_FIELD, TOTAL_CHILDREN_FIELD, TYPE_FIELD};

/// Elements per chunk when no size is given.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// How a property is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyRole {
    Inline,
    Detached,
    Chunked(usize),
    Ignored,
}

impl PropertyRole {
    /// Role implied by a property name alone.
    pub fn from_name(name: &str) -> Self {
        if is_reserved(name) || name.starts_with("__") {
            return Self::Ignored;
        }
        let Some(rest) = name.strip_prefix('@') else {
            return Self::Inline;
        };
        match parse_chunk_size(rest) {
            Some(size) => Self::Chunked(size),
            None => Self::Detached,
        }
    }
}

/// `(N)name` -> `Some(N)`, `()name` -> default size, otherwise `None`.
fn parse_chunk_size(rest: &str) -> Option<usize> {
    let inner = rest.strip_prefix('(')?;
    let close = inner.find(')')?;
    let digits = &inner[..close];
    if digits.is_empty() {
        return Some(DEFAULT_CHUNK_SIZE);
    }
    match digits.parse::<usize>() {
        Ok(0) | Err(_) => Some(DEFAULT_CHUNK_SIZE),
        Ok(n) => Some(n),
    }
}

/// Names written by the serializer itself. User properties with these names
/// are never persisted.
pub fn is_reserved(name: &str) -> bool {
    matches!(name, TYPE_FIELD | ID_FIELD | CLOSURE_FIELD | TOTAL_CHILDREN_FIELD)
}

/// Explicit roles for the properties of one node type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeDescriptor {
    type_name: String,
    roles: BTreeMap<String, PropertyRole>,
}

impl TypeDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            roles: BTreeMap::new(),
        }
    }

    pub fn detach(self, property: impl Into<String>) -> Self {
        self.role(property, PropertyRole::Detached)
    }

    pub fn chunk(self, property: impl Into<String>, size: usize) -> Self {
        let size = if size == 0 { DEFAULT_CHUNK_SIZE } else { size };
        self.role(property, PropertyRole::Chunked(size))
    }

    pub fn ignore(self, property: impl Into<String>) -> Self {
        self.role(property, PropertyRole::Ignored)
    }

    pub fn role(mut self, property: impl Into<String>, role: PropertyRole) -> Self {
        self.roles.insert(property.into(), role);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Role of `property`: the declared one, else the naming convention.
    pub fn role_of(&self, property: &str) -> PropertyRole {
        if is_reserved(property) {
            return PropertyRole::Ignored;
        }
        self.roles
            .get(property)
            .copied()
            .unwrap_or_else(|| PropertyRole::from_name(property))
    }
}

/// Descriptors by type name.
///
/// Types without a registered descriptor get an empty one, so naming
/// conventions apply to all of their properties. Lookups are cached.
#[derive(Default)]
pub struct DescriptorRegistry {
    types: RwLock<HashMap<String, Arc<TypeDescriptor>>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the descriptor for its type.
    pub fn register(&self, descriptor: TypeDescriptor) {
        let mut types = self.types.write().expect("lock poisoned");
        types.insert(descriptor.type_name.clone(), Arc::new(descriptor));
    }

    /// Descriptor for `type_name`, resolving and caching it on first use.
    pub fn resolve(&self, type_name: &str) -> Arc<TypeDescriptor> {
        if let Some(found) = self.types.read().expect("lock poisoned").get(type_name) {
            return Arc::clone(found);
        }
        let mut types = self.types.write().expect("lock poisoned");
        Arc::clone(
            types
                .entry(type_name.to_string())
                .or_insert_with(|| Arc::new(TypeDescriptor::new(type_name))),
        )
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.types.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorRegistry")
            .field("types", &self.len())
            .finish()
    }
}
