use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use keel_types::{ObjectId, Record};

use crate::copy::copy_closure;
use crate::error::{TransportError, TransportResult};
use crate::hooks::TransportHooks;

/// Callback told how many records a closure copy will visit, once known.
pub type TotalFn<'a> = &'a (dyn Fn(usize) + Send + Sync);

/// A content-addressed record store.
///
/// All implementations must satisfy these invariants:
/// - Records are immutable once written. Saving an id that is already present
///   is a no-op; if the payload differs, the backend keeps the first one.
/// - Absence is not an error: `get_object` returns `None` and `has_objects`
///   reports `false`.
/// - Writes submitted before a call to `write_complete` are durable once it
///   returns `Ok`. Reads are not required to observe writes that have not
///   been through the barrier yet.
/// - The transport never interprets payloads. Only closure copy looks inside
///   them for reference markers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name used in logs and errors.
    fn name(&self) -> &str;

    /// Cancellation and progress side channel.
    fn hooks(&self) -> &TransportHooks;

    /// Key/value description of this transport's configuration.
    fn context(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("name".to_string(), self.name().to_string())])
    }

    /// Save one record. Idempotent.
    async fn save_object(&self, id: &ObjectId, payload: &str) -> TransportResult<()>;

    /// Save many records, stopping at the first failure.
    ///
    /// The default implementation calls [`save_object`](Self::save_object)
    /// for each record. A failure reports every id saved before it.
    async fn save_objects(&self, records: &[Record]) -> TransportResult<()> {
        let mut saved = Vec::with_capacity(records.len());
        for record in records {
            self.hooks().ensure_active(self.name(), &saved)?;
            self.save_object(&record.id, &record.payload)
                .await
                .map_err(|e| e.with_durable(&saved))?;
            saved.push(record.id.clone());
        }
        Ok(())
    }

    /// Fetch `id` from `source` and save it here.
    async fn save_object_from(&self, id: &ObjectId, source: &dyn Transport) -> TransportResult<()> {
        let payload = source
            .get_object(id)
            .await?
            .ok_or_else(|| TransportError::Source {
                transport: self.name().to_string(),
                source_transport: source.name().to_string(),
                id: id.clone(),
            })?;
        self.save_object(id, &payload).await
    }

    /// Read a record. `Ok(None)` if absent.
    async fn get_object(&self, id: &ObjectId) -> TransportResult<Option<String>>;

    /// Read a record that must exist.
    async fn require_object(&self, id: &ObjectId) -> TransportResult<String> {
        self.get_object(id)
            .await?
            .ok_or_else(|| TransportError::NotFound {
                transport: self.name().to_string(),
                id: id.clone(),
            })
    }

    /// Bulk existence check. Every requested id appears in the result.
    async fn has_objects(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, bool>>;

    /// Copy the closure of `id` from this transport into `target`.
    ///
    /// Ids the target already has are skipped together with everything
    /// below them. Children are durable in the target before their parent is
    /// written. Returns the root payload.
    async fn copy_object_and_children(
        &self,
        id: &ObjectId,
        target: &dyn Transport,
        on_total: Option<TotalFn<'_>>,
    ) -> TransportResult<String> {
        let report = copy_closure(self, id, target, on_total).await?;
        Ok(report.root_payload)
    }

    /// Wait until every previously submitted write is durable.
    async fn write_complete(&self) -> TransportResult<()>;
}
