use std::collections::HashSet;

use keel_types::{ObjectId, Record};
use tracing::debug;

use crate::error::TransportResult;
use crate::traits::Transport;

/// Batches writes to one transport while keeping parents behind children.
///
/// A record is only submitted once every record it references that was
/// written through this writer has passed a `write_complete` barrier. Records
/// with no pending dependencies share a batch, so a wide graph costs one
/// barrier per level rather than one per record.
pub struct OrderedWriter<'a> {
    target: &'a dyn Transport,
    batch_size: usize,
    batch: Vec<Record>,
    unconfirmed: HashSet<ObjectId>,
    written: Vec<ObjectId>,
    confirmed: usize,
    barriers: usize,
}

impl<'a> OrderedWriter<'a> {
    pub fn new(target: &'a dyn Transport, batch_size: usize) -> Self {
        Self {
            target,
            batch_size: batch_size.max(1),
            batch: Vec::new(),
            unconfirmed: HashSet::new(),
            written: Vec::new(),
            confirmed: 0,
            barriers: 0,
        }
    }

    /// Queue `record`, which references `references`.
    pub async fn push(&mut self, record: Record, references: &[ObjectId]) -> TransportResult<()> {
        if references.iter().any(|id| self.unconfirmed.contains(id)) {
            self.barrier().await?;
        }
        self.unconfirmed.insert(record.id.clone());
        self.batch.push(record);
        if self.batch.len() >= self.batch_size {
            self.flush_batch().await?;
        }
        Ok(())
    }

    /// Ids accepted by the target so far, in submission order.
    pub fn written(&self) -> &[ObjectId] {
        &self.written
    }

    /// Submit what is left and wait for the target to make it durable.
    pub async fn finish(mut self) -> TransportResult<Vec<ObjectId>> {
        self.barrier().await?;
        debug!(
            transport = self.target.name(),
            count = self.written.len(),
            barriers = self.barriers,
            "ordered write finished"
        );
        Ok(self.written)
    }

    async fn flush_batch(&mut self) -> TransportResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.target
            .save_objects(&batch)
            .await
            .map_err(|e| e.with_durable(&self.written))?;
        self.written.extend(batch.into_iter().map(|r| r.id));
        Ok(())
    }

    async fn barrier(&mut self) -> TransportResult<()> {
        self.flush_batch().await?;
        if self.unconfirmed.is_empty() {
            return Ok(());
        }
        self.target
            .write_complete()
            .await
            .map_err(|e| e.with_durable(&self.written[..self.confirmed]))?;
        self.confirmed = self.written.len();
        self.unconfirmed.clear();
        self.barriers += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::hooks::TransportHooks;

    /// Records the sequence of calls so tests can check barrier placement.
    #[derive(Default)]
    struct Recorder {
        hooks: TransportHooks,
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        fn name(&self) -> &str {
            "Recorder"
        }

        fn hooks(&self) -> &TransportHooks {
            &self.hooks
        }

        fn context(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        async fn save_object(&self, id: &ObjectId, _payload: &str) -> TransportResult<()> {
            self.log.lock().expect("lock poisoned").push(id.to_string());
            Ok(())
        }

        async fn get_object(&self, _id: &ObjectId) -> TransportResult<Option<String>> {
            Ok(None)
        }

        async fn has_objects(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, bool>> {
            Ok(ids.iter().map(|id| (id.clone(), false)).collect())
        }

        async fn write_complete(&self) -> TransportResult<()> {
            self.log.lock().expect("lock poisoned").push("|".into());
            Ok(())
        }
    }

    fn record(id: &str) -> Record {
        Record::new(ObjectId::new(id).unwrap(), "{}")
    }

    fn oid(id: &str) -> ObjectId {
        ObjectId::new(id).unwrap()
    }

    #[tokio::test]
    async fn siblings_share_a_batch_and_parent_waits() {
        let target = Recorder::default();
        let mut writer = OrderedWriter::new(&target, 100);
        writer.push(record("a"), &[]).await.unwrap();
        writer.push(record("b"), &[]).await.unwrap();
        writer.push(record("root"), &[oid("a"), oid("b")]).await.unwrap();
        let written = writer.finish().await.unwrap();

        assert_eq!(written, vec![oid("a"), oid("b"), oid("root")]);
        let log = target.log.lock().unwrap().join(" ");
        assert_eq!(log, "a b | root |");
    }

    #[tokio::test]
    async fn references_outside_the_writer_do_not_force_barriers() {
        let target = Recorder::default();
        let mut writer = OrderedWriter::new(&target, 100);
        writer.push(record("p"), &[oid("already-there")]).await.unwrap();
        writer.finish().await.unwrap();
        assert_eq!(target.log.lock().unwrap().join(" "), "p |");
    }

    #[tokio::test]
    async fn full_batches_are_flushed_without_barrier() {
        let target = Recorder::default();
        let mut writer = OrderedWriter::new(&target, 2);
        for id in ["a", "b", "c"] {
            writer.push(record(id), &[]).await.unwrap();
        }
        assert_eq!(writer.written().len(), 2);
        writer.finish().await.unwrap();
        assert_eq!(target.log.lock().unwrap().join(" "), "a b c |");
    }
}
