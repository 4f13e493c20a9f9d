use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use keel_types::ObjectId;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::DiskConfig;
use crate::error::{TransportError, TransportResult};
use crate::hooks::TransportHooks;
use crate::traits::Transport;

/// Longest id accepted as a file name.
const MAX_FILE_NAME: usize = 255;

/// One file per record under `<base_path>/<application_scope>/`.
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so a reader never sees a partially written record. An existing file
/// is never replaced. File I/O behind the [`Transport`] methods runs on the
/// blocking pool; `clear` blocks its caller.
pub struct DiskTransport {
    name: String,
    root: PathBuf,
    saved: AtomicUsize,
    hooks: TransportHooks,
}

impl DiskTransport {
    /// Open the transport, creating its directory if needed.
    pub fn new(config: &DiskConfig) -> TransportResult<Self> {
        let root = config.base_path.join(&config.application_scope);
        fs::create_dir_all(&root).map_err(|e| TransportError::Open {
            transport: "Disk".to_string(),
            source: Box::new(e),
        })?;
        info!(path = %root.display(), "disk transport opened");
        Ok(Self {
            name: "Disk".to_string(),
            root,
            saved: AtomicUsize::new(0),
            hooks: TransportHooks::default(),
        })
    }

    pub fn with_hooks(mut self, hooks: TransportHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Directory holding the record files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for `id`, rejecting ids that are not a plain file name.
    pub fn path_for(&self, id: &ObjectId) -> TransportResult<PathBuf> {
        let raw = id.as_str();
        let reason = if raw.contains(['/', '\\']) {
            Some("contains a path separator")
        } else if raw.starts_with('.') {
            Some("starts with '.'")
        } else if raw.len() > MAX_FILE_NAME {
            Some("too long for a file name")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(TransportError::InvalidId {
                transport: self.name.clone(),
                id: raw.to_string(),
                reason,
            }),
            None => Ok(self.root.join(raw)),
        }
    }

    /// Number of saves that actually created a file.
    pub fn saved_count(&self) -> usize {
        self.saved.load(Ordering::Relaxed)
    }

    /// Delete every record file. Returns how many were removed.
    pub fn clear(&self) -> TransportResult<usize> {
        let entries = fs::read_dir(&self.root).map_err(|e| TransportError::write(&self.name, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| TransportError::write(&self.name, e))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                fs::remove_file(entry.path()).map_err(|e| TransportError::write(&self.name, e))?;
                removed += 1;
            }
        }
        debug!(path = %self.root.display(), removed, "disk transport cleared");
        Ok(removed)
    }

}

/// Run blocking file I/O off the async worker threads.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> io::Result<T> + Send + 'static) -> io::Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
}

/// Write `payload` to `path` unless it exists. Returns whether a file was created.
fn write_atomic(dir: &Path, path: &Path, payload: &str) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(payload.as_bytes())?;
    tmp.as_file().sync_all()?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        // A concurrent writer got there first with the same content.
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

#[async_trait]
impl Transport for DiskTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    fn context(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), self.name.clone()),
            ("type".to_string(), "disk".to_string()),
            ("basePath".to_string(), self.root.display().to_string()),
        ])
    }

    async fn save_object(&self, id: &ObjectId, payload: &str) -> TransportResult<()> {
        let path = self.path_for(id)?;
        let dir = self.root.clone();
        let payload = payload.to_string();
        match blocking(move || write_atomic(&dir, &path, &payload)).await {
            Ok(true) => {
                self.saved.fetch_add(1, Ordering::Relaxed);
                self.hooks.report(&self.name, 1);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!(id = %id, error = %e, "disk write failed");
                let err = TransportError::write(&self.name, e);
                self.hooks.report_error(&self.name, std::slice::from_ref(id), &err);
                Err(err)
            }
        }
    }

    async fn get_object(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let path = match self.path_for(id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        match blocking(move || fs::read_to_string(path)).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransportError::read(&self.name, id, e)),
        }
    }

    async fn has_objects(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, bool>> {
        let Some(first) = ids.first() else {
            return Ok(HashMap::new());
        };
        let lookups: Vec<(ObjectId, Option<PathBuf>)> =
            ids.iter().map(|id| (id.clone(), self.path_for(id).ok())).collect();
        blocking(move || {
            Ok(lookups
                .into_iter()
                .map(|(id, path)| {
                    let present = path.is_some_and(|p| p.is_file());
                    (id, present)
                })
                .collect())
        })
        .await
        .map_err(|e| TransportError::read(&self.name, first, e))
    }

    async fn write_complete(&self) -> TransportResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for DiskTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTransport")
            .field("root", &self.root)
            .finish()
    }
}
