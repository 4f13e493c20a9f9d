use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use keel_types::{ObjectId, Record};
use tracing::debug;

use crate::error::TransportResult;
use crate::hooks::TransportHooks;
use crate::traits::Transport;

/// In-memory, HashMap-based transport.
///
/// Intended for tests and as a scratch cache. Records live behind a `RwLock`
/// for safe concurrent access; every call completes before it returns, so
/// `write_complete` has nothing to wait for.
pub struct MemoryTransport {
    name: String,
    objects: RwLock<HashMap<ObjectId, String>>,
    saved: AtomicUsize,
    hooks: TransportHooks,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::named("Memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
            saved: AtomicUsize::new(0),
            hooks: TransportHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: TransportHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Remove every record.
    pub fn clear(&self) {
        self.objects.write().expect("lock poisoned").clear();
    }

    /// Sorted list of stored ids.
    pub fn ids(&self) -> Vec<ObjectId> {
        let map = self.objects.read().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of saves that actually inserted a record.
    pub fn saved_count(&self) -> usize {
        self.saved.load(Ordering::Relaxed)
    }

    fn insert(map: &mut HashMap<ObjectId, String>, id: &ObjectId, payload: &str) -> bool {
        if map.contains_key(id) {
            return false;
        }
        map.insert(id.clone(), payload.to_string());
        true
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    fn context(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), self.name.clone()),
            ("type".to_string(), "memory".to_string()),
        ])
    }

    async fn save_object(&self, id: &ObjectId, payload: &str) -> TransportResult<()> {
        let mut map = self.objects.write().expect("lock poisoned");
        if Self::insert(&mut map, id, payload) {
            self.saved.fetch_add(1, Ordering::Relaxed);
            self.hooks.report(&self.name, 1);
        }
        Ok(())
    }

    async fn save_objects(&self, records: &[Record]) -> TransportResult<()> {
        self.hooks.ensure_active(&self.name, &[])?;
        let mut map = self.objects.write().expect("lock poisoned");
        let inserted = records
            .iter()
            .filter(|r| Self::insert(&mut map, &r.id, &r.payload))
            .count();
        drop(map);
        self.saved.fetch_add(inserted, Ordering::Relaxed);
        self.hooks.report(&self.name, inserted);
        debug!(transport = %self.name, count = records.len(), inserted, "batch saved");
        Ok(())
    }

    async fn get_object(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(id).cloned())
    }

    async fn has_objects(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, bool>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(ids.iter().map(|id| (id.clone(), map.contains_key(id))).collect())
    }

    async fn write_complete(&self) -> TransportResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("name", &self.name)
            .field("object_count", &self.len())
            .finish()
    }
}
