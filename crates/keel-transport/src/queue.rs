//! Write-behind queue and flush worker for the object store transport.
//!
//! Producers push records and return immediately. A single background task
//! owns the consumer side: it waits for the first enqueue, lets the flush
//! interval elapse (cut short when the batch ceiling is reached or a caller
//! is waiting in `write_complete`), then drains batches with bounded PUT
//! concurrency. `pending` counts queued plus in-flight records and only
//! drops after a record's outcome has been recorded.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use keel_types::{ObjectId, Record};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::FlushConfig;
use crate::error::{TransportError, TransportResult};
use crate::hooks::TransportHooks;

const RETRY_BASE: Duration = Duration::from_millis(50);

/// Object key for `id` under `prefix`.
pub(crate) fn object_key(prefix: &Path, id: &ObjectId) -> Path {
    prefix.child(id.as_str())
}

#[derive(Default)]
struct Outcome {
    durable: Vec<ObjectId>,
    error: Option<TransportError>,
}

pub(crate) struct WriteQueue {
    items: Mutex<VecDeque<Record>>,
    pending: AtomicUsize,
    flushing: AtomicBool,
    wake: Notify,
    flush_now: Notify,
    outcome: Mutex<Outcome>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            flushing: AtomicBool::new(false),
            wake: Notify::new(),
            flush_now: Notify::new(),
            outcome: Mutex::new(Outcome::default()),
        }
    }

    /// Enqueue a record and wake the worker.
    pub(crate) fn push(&self, record: Record, ceiling: usize) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let len = {
            let mut items = self.items.lock().expect("lock poisoned");
            items.push_back(record);
            items.len()
        };
        self.wake.notify_one();
        if len >= ceiling {
            self.flush_now.notify_one();
        }
    }

    /// Ask the worker to skip the rest of its timer.
    pub(crate) fn request_flush(&self) {
        self.flush_now.notify_one();
    }

    /// Records queued or in flight.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending() == 0 && !self.flushing.load(Ordering::Acquire)
    }

    /// Result of everything flushed since the previous call.
    pub(crate) fn take_outcome(&self) -> TransportResult<Vec<ObjectId>> {
        let mut outcome = self.outcome.lock().expect("lock poisoned");
        let durable = mem::take(&mut outcome.durable);
        match outcome.error.take() {
            Some(err) => Err(err.with_durable(&durable)),
            None => Ok(durable),
        }
    }

    fn take_batch(&self, max: usize) -> Vec<Record> {
        let mut items = self.items.lock().expect("lock poisoned");
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    fn drain(&self) -> usize {
        let dropped = mem::take(&mut *self.items.lock().expect("lock poisoned")).len();
        self.pending.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }

    fn settle(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::AcqRel);
    }

    fn record_durable(&self, id: ObjectId) {
        self.outcome.lock().expect("lock poisoned").durable.push(id);
    }

    /// Keep the first failure; later ones add nothing the caller can act on.
    fn record_error(&self, err: TransportError) {
        let mut outcome = self.outcome.lock().expect("lock poisoned");
        if outcome.error.is_none() {
            outcome.error = Some(err);
        }
    }
}

/// Consumer side of a [`WriteQueue`], run as a dedicated task.
pub(crate) struct Flusher {
    pub(crate) name: String,
    pub(crate) queue: Arc<WriteQueue>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) prefix: Path,
    pub(crate) config: FlushConfig,
    pub(crate) hooks: TransportHooks,
}

impl Flusher {
    pub(crate) async fn run(self) {
        loop {
            self.queue.wake.notified().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.flush_interval()) => {}
                _ = self.queue.flush_now.notified() => {}
            }
            self.flush().await;
        }
    }

    async fn flush(&self) {
        if self
            .queue
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let ceiling = self.config.batch_size.max(1);
        loop {
            if self.hooks.is_cancelled() {
                let dropped = self.queue.drain();
                if dropped > 0 {
                    warn!(transport = %self.name, dropped, "flush cancelled, queued writes dropped");
                }
                let completed = mem::take(&mut self.queue.outcome.lock().expect("lock poisoned").durable);
                self.queue.record_error(TransportError::Cancelled {
                    transport: self.name.clone(),
                    completed,
                });
                break;
            }
            let batch = self.queue.take_batch(ceiling);
            if batch.is_empty() {
                break;
            }
            let taken = batch.len();
            let written = self.put_batch(batch).await;
            self.queue.settle(taken);
            self.hooks.report(&self.name, written);
            debug!(transport = %self.name, taken, written, "batch flushed");
            if taken < ceiling {
                break;
            }
        }
        self.queue.flushing.store(false, Ordering::Release);
    }

    /// PUT a batch. Returns how many records became durable.
    async fn put_batch(&self, batch: Vec<Record>) -> usize {
        let mut puts = stream::iter(batch)
            .map(|record| async move {
                let result = self.put(&record).await;
                (record.id, result)
            })
            .buffer_unordered(self.config.max_concurrent_puts.max(1));

        let mut written = 0;
        while let Some((id, result)) = puts.next().await {
            match result {
                Ok(()) => {
                    self.queue.record_durable(id);
                    written += 1;
                }
                Err(e) => {
                    let err = TransportError::write(&self.name, e);
                    self.hooks.report_error(&self.name, std::slice::from_ref(&id), &err);
                    if self.config.continue_on_error {
                        warn!(transport = %self.name, id = %id, error = %err, "put failed, skipping");
                        continue;
                    }
                    warn!(transport = %self.name, id = %id, error = %err, "put failed, aborting batch");
                    self.queue.record_error(err);
                    // Dropping the stream abandons the rest of the batch.
                    break;
                }
            }
        }
        written
    }

    async fn put(&self, record: &Record) -> object_store::Result<()> {
        let path = object_key(&self.prefix, &record.id);
        let body = Bytes::from(record.payload.clone());
        let mut attempt: u32 = 0;
        loop {
            match self.store.put(&path, PutPayload::from(body.clone())).await {
                Ok(_) => return Ok(()),
                Err(e @ object_store::Error::Generic { .. })
                    if (attempt as usize) < self.config.max_retries =>
                {
                    attempt += 1;
                    let delay = RETRY_BASE * 2u32.saturating_pow(attempt);
                    debug!(id = %record.id, attempt, error = %e, "retrying put");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
