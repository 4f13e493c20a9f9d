use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use keel_types::{ObjectId, Record};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{FlushConfig, ObjectStoreConfig};
use crate::error::{TransportError, TransportResult};
use crate::hooks::TransportHooks;
use crate::queue::{object_key, Flusher, WriteQueue};
use crate::traits::Transport;

/// Write-behind transport over any [`ObjectStore`], usually an S3 bucket.
///
/// `save_object` only enqueues. A background task batches the queue into
/// parallel PUTs; `write_complete` is the barrier that waits for it. Reads go
/// straight to the store, so a record may be invisible to `get_object` until
/// its write has been flushed.
pub struct ObjectStoreTransport {
    name: String,
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    config: FlushConfig,
    queue: Arc<WriteQueue>,
    hooks: TransportHooks,
    worker: JoinHandle<()>,
}

impl ObjectStoreTransport {
    /// Wrap `store`, keeping records under `prefix`.
    ///
    /// Spawns the flush worker on the current tokio runtime.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        config: FlushConfig,
        hooks: TransportHooks,
    ) -> TransportResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TransportError::Config("object store transport must be created inside a tokio runtime".to_string())
        })?;
        let name = "ObjectStore".to_string();
        let prefix = Path::from(prefix);
        let queue = Arc::new(WriteQueue::new());
        let flusher = Flusher {
            name: name.clone(),
            queue: Arc::clone(&queue),
            store: Arc::clone(&store),
            prefix: prefix.clone(),
            config: config.clone(),
            hooks: hooks.clone(),
        };
        let worker = runtime.spawn(flusher.run());
        info!(store = %store, prefix = %prefix, "object store transport opened");
        Ok(Self {
            name,
            store,
            prefix,
            config,
            queue,
            hooks,
            worker,
        })
    }

    /// Build an S3 client from `config`.
    ///
    /// Fields left unset are read from the `ACCESS_KEY`, `SECRET_KEY`,
    /// `REGION`, `BUCKET_NAME`, `BUCKET_PATH` and `ENDPOINT` environment
    /// variables. Explicit values win.
    pub fn s3(config: &ObjectStoreConfig, hooks: TransportHooks) -> TransportResult<Self> {
        Self::connect(&config.clone().with_env_fallback(), hooks)
    }

    /// Like [`s3`](Self::s3), resolving unset fields through `lookup`
    /// instead of the process environment.
    pub fn s3_with(
        config: &ObjectStoreConfig,
        lookup: impl Fn(&str) -> Option<String>,
        hooks: TransportHooks,
    ) -> TransportResult<Self> {
        Self::connect(&config.clone().with_fallback(lookup), hooks)
    }

    fn connect(config: &ObjectStoreConfig, hooks: TransportHooks) -> TransportResult<Self> {
        let bucket = config.require_bucket()?;
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_allow_http(config.allow_http)
            .with_retry(RetryConfig {
                max_retries: config.flush.max_retries,
                ..RetryConfig::default()
            });
        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(key) = &config.access_key {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &config.secret_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder.build().map_err(|e| TransportError::Open {
            transport: "ObjectStore".to_string(),
            source: Box::new(e),
        })?;
        let prefix = config.path_prefix.as_deref().unwrap_or("");
        Self::new(Arc::new(store), prefix, config.flush.clone(), hooks)
    }

    /// Records queued or in flight.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

#[async_trait]
impl Transport for ObjectStoreTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    fn context(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), self.name.clone()),
            ("type".to_string(), "object_store".to_string()),
            ("store".to_string(), self.store.to_string()),
            ("prefix".to_string(), self.prefix.to_string()),
        ])
    }

    async fn save_object(&self, id: &ObjectId, payload: &str) -> TransportResult<()> {
        self.hooks.ensure_active(&self.name, &[])?;
        self.queue
            .push(Record::new(id.clone(), payload), self.config.batch_size.max(1));
        Ok(())
    }

    async fn save_objects(&self, records: &[Record]) -> TransportResult<()> {
        self.hooks.ensure_active(&self.name, &[])?;
        for record in records {
            self.queue.push(record.clone(), self.config.batch_size.max(1));
        }
        Ok(())
    }

    async fn get_object(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let path = object_key(&self.prefix, id);
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(TransportError::read(&self.name, id, e)),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|e| TransportError::read(&self.name, id, e))?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| TransportError::CorruptRecord {
                id: id.clone(),
                reason: "payload is not valid UTF-8".to_string(),
            })
    }

    async fn has_objects(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, bool>> {
        let mut lookups = stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let result = self.store.head(&object_key(&self.prefix, &id)).await;
                (id, result)
            })
            .buffer_unordered(self.config.max_concurrent_puts.max(1));

        let mut found = HashMap::with_capacity(ids.len());
        while let Some((id, result)) = lookups.next().await {
            let present = match result {
                Ok(_) => true,
                Err(object_store::Error::NotFound { .. }) => false,
                Err(e) => return Err(TransportError::read(&self.name, &id, e)),
            };
            found.insert(id, present);
        }
        Ok(found)
    }

    async fn write_complete(&self) -> TransportResult<()> {
        let started = Instant::now();
        let timeout = self.config.write_timeout();
        let mut delay = self.config.poll_initial();
        if !self.queue.is_idle() {
            self.queue.request_flush();
        }
        while !self.queue.is_idle() {
            let waited = started.elapsed();
            if waited >= timeout {
                warn!(transport = %self.name, pending = self.queue.pending(), "write_complete timed out");
                return Err(TransportError::Timeout {
                    transport: self.name.clone(),
                    waited,
                    pending: self.queue.pending(),
                });
            }
            tokio::time::sleep(delay.min(timeout - waited)).await;
            delay = backoff(delay, self.config.poll_max());
        }
        let durable = self.queue.take_outcome()?;
        debug!(transport = %self.name, count = durable.len(), "writes complete");
        Ok(())
    }
}

/// Next polling delay: doubled, capped at `max`.
fn backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

impl Drop for ObjectStoreTransport {
    fn drop(&mut self) {
        let pending = self.queue.pending();
        if pending > 0 {
            warn!(transport = %self.name, pending, "dropped with unflushed writes");
        }
        self.worker.abort();
    }
}

impl std::fmt::Debug for ObjectStoreTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreTransport")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .field("pending", &self.queue.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::stream::BoxStream;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, PutMultipartOpts, PutOptions, PutPayload,
        PutResult,
    };

    use crate::copy::copy_closure;
    use crate::hooks::CancelSignal;
    use crate::memory::MemoryTransport;

    fn oid(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    fn flush(interval_ms: u64, batch_size: usize) -> FlushConfig {
        FlushConfig {
            flush_interval_ms: interval_ms,
            batch_size,
            write_timeout_ms: 10_000,
            ..FlushConfig::default()
        }
    }

    fn open(config: FlushConfig) -> (Arc<InMemory>, ObjectStoreTransport) {
        let backing = Arc::new(InMemory::new());
        let transport =
            ObjectStoreTransport::new(backing.clone(), "tests", config, TransportHooks::default()).unwrap();
        (backing, transport)
    }

    async fn stored_count(store: &InMemory) -> usize {
        let listed: Vec<_> = store.list(None).try_collect().await.unwrap();
        listed.len()
    }

    /// `InMemory` that rejects PUTs to `fail` ids and never answers PUTs
    /// to `stall` ids.
    #[derive(Debug)]
    struct FaultyStore {
        inner: InMemory,
        fail: Vec<&'static str>,
        stall: Vec<&'static str>,
    }

    impl FaultyStore {
        fn new(fail: Vec<&'static str>, stall: Vec<&'static str>) -> Self {
            Self {
                inner: InMemory::new(),
                fail,
                stall,
            }
        }
    }

    impl std::fmt::Display for FaultyStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FaultyStore({})", self.inner)
        }
    }

    #[async_trait]
    impl ObjectStore for FaultyStore {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            let id = location.filename().unwrap_or_default();
            if self.stall.iter().any(|s| *s == id) {
                std::future::pending::<()>().await;
            }
            if self.fail.iter().any(|f| *f == id) {
                return Err(object_store::Error::NotImplemented);
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(&self, location: &Path, options: GetOptions) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    /// Sequential PUTs so the order of outcomes is deterministic.
    fn open_faulty(store: FaultyStore, config: FlushConfig, hooks: TransportHooks) -> (Arc<FaultyStore>, ObjectStoreTransport) {
        let store = Arc::new(store);
        let config = FlushConfig {
            max_concurrent_puts: 1,
            ..config
        };
        let transport = ObjectStoreTransport::new(store.clone(), "tests", config, hooks).unwrap();
        (store, transport)
    }

    fn records(ids: &[&str]) -> Vec<Record> {
        ids.iter().map(|id| Record::new(oid(id), format!("payload-{id}"))).collect()
    }

    // -----------------------------------------------------------------------
    // Round trip and barrier
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn save_then_barrier_then_get() {
        let (_, s3) = open(flush(20, 1000));
        s3.save_object(&oid("MyTestObjectId"), "MyTestObjectData").await.unwrap();
        s3.write_complete().await.unwrap();

        assert_eq!(
            s3.get_object(&oid("MyTestObjectId")).await.unwrap().as_deref(),
            Some("MyTestObjectData")
        );
        assert_eq!(s3.pending(), 0);
        assert_eq!(s3.context()["prefix"], "tests");
    }

    #[tokio::test]
    async fn reads_can_run_ahead_of_queued_writes() {
        // Long timer: nothing flushes until someone waits on the barrier.
        let (_, s3) = open(flush(60_000, 1000));
        s3.save_object(&oid("a"), "x").await.unwrap();
        assert_eq!(s3.get_object(&oid("a")).await.unwrap(), None);
        assert_eq!(s3.pending(), 1);

        s3.write_complete().await.unwrap();
        assert_eq!(s3.get_object(&oid("a")).await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn keys_use_the_configured_prefix() {
        let (backing, s3) = open(flush(10, 1000));
        s3.save_object(&oid("abc"), "payload").await.unwrap();
        s3.write_complete().await.unwrap();
        backing.head(&Path::from("tests/abc")).await.unwrap();
    }

    #[tokio::test]
    async fn batches_larger_than_the_ceiling_all_land() {
        let (backing, s3) = open(flush(10, 7));
        let records: Vec<Record> = (0..50).map(|i| Record::new(oid(&format!("r{i}")), "p")).collect();
        s3.save_objects(&records).await.unwrap();
        s3.write_complete().await.unwrap();
        assert_eq!(stored_count(&backing).await, 50);
    }

    #[tokio::test]
    async fn has_objects_uses_head() {
        let (_, s3) = open(flush(10, 1000));
        s3.save_object(&oid("here"), "x").await.unwrap();
        s3.write_complete().await.unwrap();
        let found = s3.has_objects(&[oid("here"), oid("gone")]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[&oid("here")]);
        assert!(!found[&oid("gone")]);
    }

    #[tokio::test]
    async fn saving_twice_stores_one_object() {
        let (backing, s3) = open(flush(10, 1000));
        s3.save_object(&oid("a"), "x").await.unwrap();
        s3.save_object(&oid("a"), "x").await.unwrap();
        s3.write_complete().await.unwrap();
        s3.save_object(&oid("a"), "x").await.unwrap();
        s3.write_complete().await.unwrap();

        assert_eq!(stored_count(&backing).await, 1);
        assert_eq!(s3.get_object(&oid("a")).await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn idle_barrier_returns_immediately() {
        let (_, s3) = open(flush(60_000, 1000));
        tokio::time::timeout(Duration::from_secs(1), s3.write_complete())
            .await
            .unwrap()
            .unwrap();
    }

    // -----------------------------------------------------------------------
    // Concurrency, cancellation, closure copy
    // -----------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers() {
        let (backing, s3) = open(flush(5, 64));
        let s3 = Arc::new(s3);
        let mut handles = Vec::new();
        for worker in 0..8 {
            let s3 = Arc::clone(&s3);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    s3.save_object(&oid(&format!("w{worker}-{i}")), "data").await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        s3.write_complete().await.unwrap();
        assert_eq!(stored_count(&backing).await, 400);
    }

    #[tokio::test]
    async fn cancellation_drops_queued_writes() {
        let cancel = CancelSignal::new();
        let backing = Arc::new(InMemory::new());
        let s3 = ObjectStoreTransport::new(
            backing.clone(),
            "tests",
            flush(60_000, 1000),
            TransportHooks::new().with_cancel(cancel.clone()),
        )
        .unwrap();
        s3.save_object(&oid("a"), "x").await.unwrap();
        cancel.cancel();

        let err = s3.write_complete().await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled { .. }));
        assert_eq!(stored_count(&backing).await, 0);
        assert!(matches!(
            s3.save_object(&oid("b"), "y").await,
            Err(TransportError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn closure_copy_into_write_behind_target() {
        let source = MemoryTransport::new();
        source
            .save_object(&oid("root"), r#"{"id":"root","child":{"ref":"leaf"}}"#)
            .await
            .unwrap();
        source.save_object(&oid("leaf"), r#"{"id":"leaf"}"#).await.unwrap();
        let (_, s3) = open(flush(60_000, 1000));

        let report = copy_closure(&source, &oid("root"), &s3, None).await.unwrap();

        assert_eq!(report.copied, vec![oid("leaf"), oid("root")]);
        assert_eq!(s3.pending(), 0);
        assert!(s3.get_object(&oid("root")).await.unwrap().is_some());
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failed_put_aborts_the_batch_and_reports_durable_ids() {
        let failed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&failed);
        let hooks = TransportHooks::new().with_error_handler(move |_, ids, _| {
            sink.lock().unwrap().extend_from_slice(ids);
        });
        let (store, s3) = open_faulty(FaultyStore::new(vec!["bad"], vec![]), flush(60_000, 1000), hooks);

        s3.save_objects(&records(&["a", "bad", "c"])).await.unwrap();
        let err = s3.write_complete().await.unwrap_err();

        assert!(matches!(err, TransportError::Write { .. }));
        assert_eq!(err.durable_ids(), &[oid("a")]);
        assert_eq!(*failed.lock().unwrap(), vec![oid("bad")]);
        assert_eq!(s3.pending(), 0);
        assert!(s3.get_object(&oid("c")).await.unwrap().is_none());
        assert_eq!(stored_count(&store.inner).await, 1);

        // The failure is reported once; the next barrier starts clean.
        s3.write_complete().await.unwrap();
    }

    #[tokio::test]
    async fn continue_on_error_skips_failed_puts() {
        let failed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&failed);
        let hooks = TransportHooks::new().with_error_handler(move |transport, ids, _| {
            assert_eq!(transport, "ObjectStore");
            sink.lock().unwrap().extend_from_slice(ids);
        });
        let config = FlushConfig {
            continue_on_error: true,
            ..flush(60_000, 1000)
        };
        let (store, s3) = open_faulty(FaultyStore::new(vec!["bad"], vec![]), config, hooks);

        s3.save_objects(&records(&["a", "bad", "c"])).await.unwrap();
        s3.write_complete().await.unwrap();

        assert_eq!(*failed.lock().unwrap(), vec![oid("bad")]);
        assert_eq!(stored_count(&store.inner).await, 2);
        assert!(s3.get_object(&oid("bad")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stalled_put_times_out_the_barrier() {
        let store = FaultyStore::new(vec![], vec!["slow"]);
        let config = FlushConfig {
            write_timeout_ms: 100,
            poll_initial_ms: 5,
            poll_max_ms: 20,
            ..flush(10, 1000)
        };
        let (_, s3) = open_faulty(store, config, TransportHooks::default());

        s3.save_object(&oid("slow"), "x").await.unwrap();
        let err = s3.write_complete().await.unwrap_err();

        match &err {
            TransportError::Timeout { transport, waited, pending } => {
                assert_eq!(transport, "ObjectStore");
                assert!(*waited >= Duration::from_millis(100));
                assert_eq!(*pending, 1);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling_without_overflow() {
        let max = Duration::from_millis(500);
        assert_eq!(backoff(Duration::from_millis(10), max), Duration::from_millis(20));
        assert_eq!(backoff(Duration::from_millis(400), max), max);
        assert_eq!(backoff(Duration::MAX, Duration::MAX), Duration::MAX);
        let huge = Duration::from_millis(u64::MAX);
        assert_eq!(backoff(huge, huge), huge);
    }

    #[tokio::test]
    async fn s3_requires_a_bucket() {
        let err = ObjectStoreTransport::s3_with(&ObjectStoreConfig::default(), |_| None, TransportHooks::default())
            .unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    fn env(key: &str) -> Option<String> {
        match key {
            "BUCKET_NAME" => Some("env-bucket".to_string()),
            "REGION" => Some("us-east-1".to_string()),
            "BUCKET_PATH" => Some("env/prefix".to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn s3_falls_back_to_the_environment() {
        let s3 = ObjectStoreTransport::s3_with(&ObjectStoreConfig::default(), env, TransportHooks::default())
            .unwrap();
        assert!(s3.store().to_string().contains("env-bucket"));
        assert_eq!(s3.context()["prefix"], "env/prefix");
    }

    #[tokio::test]
    async fn explicit_s3_settings_win_over_the_environment() {
        let config = ObjectStoreConfig {
            bucket: Some("explicit".to_string()),
            path_prefix: Some("mine".to_string()),
            ..ObjectStoreConfig::default()
        };
        let s3 = ObjectStoreTransport::s3_with(&config, env, TransportHooks::default()).unwrap();
        assert!(s3.store().to_string().contains("explicit"));
        assert_eq!(s3.context()["prefix"], "mine");
    }

    #[test]
    fn construction_outside_runtime_is_a_config_error() {
        let err = ObjectStoreTransport::new(
            Arc::new(InMemory::new()),
            "",
            FlushConfig::default(),
            TransportHooks::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }
}
