use std::sync::Arc;

use futures::future::try_join_all;
use keel_transport::{copy_closure, CancelSignal, CopyReport, OrderedWriter, Transport, TransportError};
use keel_types::ObjectId;
use tracing::info;

use crate::deserializer;
use crate::descriptor::DescriptorRegistry;
use crate::error::{GraphError, GraphResult};
use crate::node::Node;
use crate::serializer::{decompose, Decomposition};

/// Records per `save_objects` call when storing a graph.
pub const STORE_BATCH_SIZE: usize = 1000;

/// Stores, loads, and copies object graphs through transports.
#[derive(Clone, Debug, Default)]
pub struct ClosureCopier {
    registry: Arc<DescriptorRegistry>,
    cancel: CancelSignal,
}

impl ClosureCopier {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self {
            registry,
            cancel: CancelSignal::new(),
        }
    }

    /// Observe `cancel` in `store`, `load`, and `decompose`.
    ///
    /// `copy` is governed by the source transport's own hooks.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    /// Decompose `root` without storing anything.
    pub fn decompose(&self, root: &Node) -> GraphResult<Decomposition> {
        decompose(root, &self.registry, Some(&self.cancel))
    }

    /// Content id `root` would be stored under.
    pub fn id_of(&self, root: &Node) -> GraphResult<ObjectId> {
        Ok(self.decompose(root)?.root_id)
    }

    /// Store the graph in every target and return the root id.
    ///
    /// Targets are written concurrently. Each receives children before
    /// parents and has passed `write_complete` when this returns.
    pub async fn store(&self, root: &Node, targets: &[&dyn Transport]) -> GraphResult<ObjectId> {
        let decomposition = self.decompose(root)?;
        try_join_all(targets.iter().map(|target| self.write(&decomposition, *target))).await?;
        info!(
            root = %decomposition.root_id,
            records = decomposition.records.len(),
            targets = targets.len(),
            "graph stored"
        );
        Ok(decomposition.root_id)
    }

    async fn write(&self, decomposition: &Decomposition, target: &dyn Transport) -> GraphResult<()> {
        let mut writer = OrderedWriter::new(target, STORE_BATCH_SIZE);
        for entry in &decomposition.records {
            if self.cancel.is_cancelled() {
                let completed = writer.finish().await?;
                return Err(GraphError::Transport(TransportError::Cancelled {
                    transport: target.name().to_string(),
                    completed,
                }));
            }
            writer.push(entry.record.clone(), &entry.references).await?;
        }
        writer.finish().await?;
        Ok(())
    }

    /// Load the graph rooted at `id` from `source`.
    pub async fn load(&self, id: &ObjectId, source: &dyn Transport) -> GraphResult<Node> {
        deserializer::load(id, source, Some(&self.cancel)).await
    }

    /// Copy the closure of `id` from `source` into `target`.
    pub async fn copy(&self, id: &ObjectId, source: &dyn Transport, target: &dyn Transport) -> GraphResult<CopyReport> {
        Ok(copy_closure(source, id, target, None).await?)
    }
}
