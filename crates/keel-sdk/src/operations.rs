use std::sync::Arc;

use keel_graph::{ClosureCopier, DescriptorRegistry, Node};
use keel_transport::{Transport, TransportConfig};
use keel_types::ObjectId;
use tracing::{debug, info};

use crate::error::{SdkError, SdkResult};

/// Send and receive object graphs through a local cache.
///
/// Every graph sent is also written to the local transport, and every graph
/// received is read from it, copying the closure in from a remote first when
/// the cache does not have the root.
pub struct Operations {
    local: Arc<dyn Transport>,
    copier: ClosureCopier,
}

impl Operations {
    pub fn new(local: Arc<dyn Transport>) -> Self {
        Self::with_copier(local, ClosureCopier::new(Arc::new(DescriptorRegistry::new())))
    }

    pub fn with_copier(local: Arc<dyn Transport>, copier: ClosureCopier) -> Self {
        Self { local, copier }
    }

    /// Build the local cache from configuration.
    pub fn from_config(config: &TransportConfig) -> SdkResult<Self> {
        Ok(Self::new(config.build()?))
    }

    pub fn local(&self) -> &Arc<dyn Transport> {
        &self.local
    }

    pub fn copier(&self) -> &ClosureCopier {
        &self.copier
    }

    /// Store `root` in the local cache and every remote. Returns its id.
    pub async fn send(&self, root: &Node, remotes: &[&dyn Transport]) -> SdkResult<ObjectId> {
        let mut targets: Vec<&dyn Transport> = Vec::with_capacity(remotes.len() + 1);
        targets.push(self.local.as_ref());
        targets.extend_from_slice(remotes);
        let id = self.copier.store(root, &targets).await?;
        info!(id = %id, remotes = remotes.len(), "sent");
        Ok(id)
    }

    /// Load the graph rooted at `id`.
    ///
    /// A root already in the local cache is trusted to have its closure
    /// there too. Otherwise the closure is copied from `remote` first.
    pub async fn receive(&self, id: &ObjectId, remote: Option<&dyn Transport>) -> SdkResult<Node> {
        let cached = self
            .local
            .has_objects(std::slice::from_ref(id))
            .await?
            .get(id)
            .copied()
            .unwrap_or(false);

        if cached {
            debug!(id = %id, "receiving from local cache");
        } else {
            let Some(remote) = remote else {
                return Err(SdkError::ObjectNotFound(id.clone()));
            };
            let report = self.copier.copy(id, remote, self.local.as_ref()).await?;
            debug!(id = %id, remote = remote.name(), copied = report.copied.len(), "closure fetched");
        }
        Ok(self.copier.load(id, self.local.as_ref()).await?)
    }
}

impl std::fmt::Debug for Operations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operations")
            .field("local", &self.local.name())
            .field("copier", &self.copier)
            .finish()
    }
}
