//! Closure copy between transports.
//!
//! The walk is an explicit-stack depth-first traversal over reference markers
//! found in payloads. Every id is visited at most once, so a damaged store
//! containing a reference cycle still terminates. Before descending into a
//! node's children the target is queried with one `has_objects` call; an id
//! the target already has is skipped together with its whole subtree, since
//! a record is only ever written after its closure.

use std::collections::HashSet;

use keel_types::wire::{closure_table, embedded_id, references};
use keel_types::{ObjectId, Record};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{TransportError, TransportResult};
use crate::ordered::OrderedWriter;
use crate::traits::{TotalFn, Transport};

/// Records submitted to the target per `save_objects` call during a copy.
pub const COPY_BATCH_SIZE: usize = 1000;

/// Outcome of a closure copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Payload of the root record.
    pub root_payload: String,
    /// Ids written to the target, children before parents.
    pub copied: Vec<ObjectId>,
    /// Ids the target already had. Their subtrees were not visited.
    pub skipped: usize,
    /// Closure size advertised by the root, when it carries one.
    pub total: Option<usize>,
}

enum Step {
    Visit(ObjectId),
    Emit(Record, Vec<ObjectId>),
}

struct Walk<'a> {
    target: &'a dyn Transport,
    visited: HashSet<ObjectId>,
    present: HashSet<ObjectId>,
    known_missing: HashSet<ObjectId>,
}

impl Walk<'_> {
    /// Children of a node that still have to be visited, in document order.
    async fn pending_children(&mut self, refs: &[ObjectId]) -> TransportResult<Vec<ObjectId>> {
        let unknown: Vec<ObjectId> = refs
            .iter()
            .filter(|id| {
                !self.visited.contains(*id)
                    && !self.present.contains(*id)
                    && !self.known_missing.contains(*id)
            })
            .cloned()
            .collect();
        if !unknown.is_empty() {
            let present = self.target.has_objects(&unknown).await?;
            for id in unknown {
                if present.get(&id).copied().unwrap_or(false) {
                    self.present.insert(id);
                } else {
                    self.known_missing.insert(id);
                }
            }
        }
        Ok(refs
            .iter()
            .filter(|id| !self.visited.contains(*id) && !self.present.contains(*id))
            .cloned()
            .collect())
    }
}

/// Copy the closure of `root` from `source` into `target`.
///
/// `on_total` is called once with the number of records in the closure when
/// the root advertises it. The target's `write_complete` has returned by the
/// time this resolves.
pub async fn copy_closure<S>(
    source: &S,
    root: &ObjectId,
    target: &dyn Transport,
    on_total: Option<TotalFn<'_>>,
) -> TransportResult<CopyReport>
where
    S: Transport + ?Sized,
{
    let hooks = source.hooks();
    let root_payload = source.require_object(root).await?;
    let root_value = parse_checked(root, &root_payload)?;
    let root_refs = root_value.as_ref().map(references).unwrap_or_default();
    let total = root_value.as_ref().map(|v| closure_size(v, &root_refs));
    if let (Some(cb), Some(n)) = (on_total, total) {
        cb(n);
    }

    let present = target.has_objects(std::slice::from_ref(root)).await?;
    if present.get(root).copied().unwrap_or(false) {
        debug!(id = %root, target = target.name(), "root already present, nothing to copy");
        return Ok(CopyReport {
            root_payload,
            copied: Vec::new(),
            skipped: 1,
            total,
        });
    }

    let mut walk = Walk {
        target,
        visited: HashSet::from([root.clone()]),
        present: HashSet::new(),
        known_missing: HashSet::new(),
    };
    let mut writer = OrderedWriter::new(target, COPY_BATCH_SIZE);
    let mut stack = Vec::new();

    let children = walk.pending_children(&root_refs).await?;
    stack.push(Step::Emit(Record::new(root.clone(), root_payload.clone()), root_refs));
    stack.extend(children.into_iter().rev().map(Step::Visit));

    while let Some(step) = stack.pop() {
        if hooks.is_cancelled() {
            let completed = writer.finish().await?;
            debug!(id = %root, count = completed.len(), "closure copy cancelled");
            return Err(TransportError::Cancelled {
                transport: source.name().to_string(),
                completed,
            });
        }
        match step {
            Step::Visit(id) => {
                if !walk.visited.insert(id.clone()) {
                    continue;
                }
                let payload = source.require_object(&id).await?;
                let refs = parse_checked(&id, &payload)?
                    .as_ref()
                    .map(references)
                    .unwrap_or_default();
                let children = walk.pending_children(&refs).await?;
                stack.push(Step::Emit(Record::new(id, payload), refs));
                stack.extend(children.into_iter().rev().map(Step::Visit));
            }
            Step::Emit(record, refs) => {
                writer.push(record, &refs).await?;
                hooks.report(source.name(), 1);
            }
        }
    }

    let copied = writer.finish().await?;
    info!(
        id = %root,
        source = source.name(),
        target = target.name(),
        copied = copied.len(),
        skipped = walk.present.len(),
        "closure copied"
    );
    Ok(CopyReport {
        root_payload,
        copied,
        skipped: walk.present.len(),
        total,
    })
}

/// Parse a payload and check that an embedded id matches the key it was
/// stored under. Payloads that are not JSON are opaque leaves.
fn parse_checked(id: &ObjectId, payload: &str) -> TransportResult<Option<Value>> {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Ok(None);
    };
    if let Some(embedded) = embedded_id(&value) {
        if embedded != *id {
            return Err(TransportError::CorruptRecord {
                id: id.clone(),
                reason: format!("payload claims id {embedded}"),
            });
        }
    }
    Ok(Some(value))
}

fn closure_size(value: &Value, direct: &[ObjectId]) -> usize {
    closure_table(value).map_or(direct.len(), |table| table.len()) + 1
}
