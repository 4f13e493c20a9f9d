use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_types::{ObjectId, Record};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::SqliteConfig;
use crate::error::{BoxError, TransportError, TransportResult};
use crate::hooks::TransportHooks;
use crate::traits::Transport;

/// Ids per `SELECT ... IN (...)` query. Stays under SQLite's bound-parameter limit.
const EXISTENCE_CHUNK: usize = 500;

const INSERT: &str = "INSERT OR IGNORE INTO objects(hash, content) VALUES (?1, ?2)";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS objects(
    hash TEXT PRIMARY KEY,
    content TEXT
) WITHOUT ROWID;";

/// Embedded relational transport backed by a single SQLite file.
///
/// One connection is shared behind a mutex, which serializes writers in
/// this process; WAL mode lets readers in other processes proceed.
/// [`Transport`] calls run their statements on the blocking pool. The
/// maintenance methods (`update_object`, `delete_object`, `all_objects`,
/// `len`, `clear`) block their caller.
pub struct SqliteTransport {
    name: String,
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    batch_size: usize,
    saved: AtomicUsize,
    hooks: TransportHooks,
}

impl SqliteTransport {
    /// Open (or create) `<base_path>/<application_name>/<scope>.db`.
    pub fn new(config: &SqliteConfig) -> TransportResult<Self> {
        let dir = config.base_path.join(&config.application_name);
        fs::create_dir_all(&dir).map_err(open_error)?;
        let path = dir.join(format!("{}.db", config.scope));
        let conn = Connection::open(&path).map_err(open_error)?;
        let transport = Self::from_connection(conn, path, config.batch_size)?;
        info!(path = %transport.path.display(), "sqlite transport opened");
        Ok(transport)
    }

    /// Transient database that lives only as long as the transport.
    pub fn in_memory() -> TransportResult<Self> {
        let conn = Connection::open_in_memory().map_err(open_error)?;
        Self::from_connection(conn, PathBuf::from(":memory:"), SqliteConfig::default().batch_size)
    }

    fn from_connection(conn: Connection, path: PathBuf, batch_size: usize) -> TransportResult<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(open_error)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(open_error)?;
        conn.execute_batch(SCHEMA).map_err(open_error)?;
        Ok(Self {
            name: "SQLite".to_string(),
            path,
            conn: Arc::new(Mutex::new(conn)),
            batch_size: batch_size.max(1),
            saved: AtomicUsize::new(0),
            hooks: TransportHooks::default(),
        })
    }

    pub fn with_hooks(mut self, hooks: TransportHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows actually inserted by this transport.
    pub fn saved_count(&self) -> usize {
        self.saved.load(Ordering::Relaxed)
    }

    /// Replace the payload stored under `id`, inserting it if absent.
    pub fn update_object(&self, id: &ObjectId, payload: &str) -> TransportResult<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "REPLACE INTO objects(hash, content) VALUES (?1, ?2)",
            params![id.as_str(), payload],
        )
        .map_err(|e| TransportError::write(&self.name, e))?;
        Ok(())
    }

    /// Delete one record. Returns `true` if it existed.
    pub fn delete_object(&self, id: &ObjectId) -> TransportResult<bool> {
        let conn = self.conn.lock().expect("lock poisoned");
        let n = conn
            .execute("DELETE FROM objects WHERE hash = ?1", params![id.as_str()])
            .map_err(|e| TransportError::write(&self.name, e))?;
        Ok(n > 0)
    }

    /// Every stored record, ordered by id.
    pub fn all_objects(&self) -> TransportResult<Vec<Record>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare("SELECT hash, content FROM objects ORDER BY hash")
            .map_err(|e| self.scan_error(e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| self.scan_error(e))?;
        let mut out = Vec::new();
        for row in rows {
            let (hash, content) = row.map_err(|e| self.scan_error(e))?;
            let id = ObjectId::new(hash.as_str()).map_err(|e| TransportError::InvalidId {
                transport: self.name.clone(),
                id: hash.clone(),
                reason: match e {
                    keel_types::TypeError::EmptyId => "empty id",
                    _ => "not a valid id",
                },
            })?;
            out.push(Record::new(id, content));
        }
        Ok(out)
    }

    /// Number of stored records.
    pub fn len(&self) -> TransportResult<usize> {
        let conn = self.conn.lock().expect("lock poisoned");
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))
            .map_err(|e| self.scan_error(e))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Delete every record.
    pub fn clear(&self) -> TransportResult<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute("DELETE FROM objects", [])
            .map_err(|e| TransportError::write(&self.name, e))?;
        Ok(())
    }

    /// Run `f` on the blocking pool with the connection locked.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, BoxError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        match tokio::task::spawn_blocking(move || f(&mut conn.lock().expect("lock poisoned"))).await {
            Ok(result) => result.map_err(Into::into),
            Err(e) => Err(e.into()),
        }
    }

    /// Wrap a failed write of `ids`, telling the error hook about it.
    fn write_failure(&self, ids: &[ObjectId], source: BoxError, durable: &[ObjectId]) -> TransportError {
        let err = TransportError::write(&self.name, source).with_durable(durable);
        self.hooks.report_error(&self.name, ids, &err);
        err
    }

    fn scan_error(&self, e: rusqlite::Error) -> TransportError {
        TransportError::Open {
            transport: self.name.clone(),
            source: Box::new(e),
        }
    }
}

fn open_error(e: impl std::error::Error + Send + Sync + 'static) -> TransportError {
    TransportError::Open {
        transport: "SQLite".to_string(),
        source: Box::new(e),
    }
}

#[async_trait]
impl Transport for SqliteTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    fn context(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), self.name.clone()),
            ("type".to_string(), "sqlite".to_string()),
            ("location".to_string(), self.path.display().to_string()),
        ])
    }

    async fn save_object(&self, id: &ObjectId, payload: &str) -> TransportResult<()> {
        let (hash, content) = (id.to_string(), payload.to_string());
        let inserted = self
            .with_conn(move |conn| conn.execute(INSERT, params![hash, content]))
            .await
            .map_err(|e| {
                warn!(id = %id, error = %e, "sqlite insert failed");
                self.write_failure(std::slice::from_ref(id), e, &[])
            })?;
        self.saved.fetch_add(inserted, Ordering::Relaxed);
        self.hooks.report(&self.name, inserted);
        Ok(())
    }

    async fn save_objects(&self, records: &[Record]) -> TransportResult<()> {
        let mut durable: Vec<ObjectId> = Vec::with_capacity(records.len());
        for batch in records.chunks(self.batch_size) {
            self.hooks.ensure_active(&self.name, &durable)?;
            let owned = batch.to_vec();
            let committed = self
                .with_conn(move |conn| {
                    let tx = conn.transaction()?;
                    let mut inserted = 0;
                    {
                        let mut stmt = tx.prepare_cached(INSERT)?;
                        for record in &owned {
                            inserted += stmt.execute(params![record.id.as_str(), record.payload])?;
                        }
                    }
                    tx.commit()?;
                    Ok(inserted)
                })
                .await;
            let inserted = match committed {
                Ok(inserted) => inserted,
                Err(e) => {
                    warn!(count = batch.len(), error = %e, "sqlite batch failed");
                    let ids: Vec<ObjectId> = batch.iter().map(|r| r.id.clone()).collect();
                    return Err(self.write_failure(&ids, e, &durable));
                }
            };
            durable.extend(batch.iter().map(|r| r.id.clone()));
            self.saved.fetch_add(inserted, Ordering::Relaxed);
            self.hooks.report(&self.name, inserted);
            debug!(count = batch.len(), inserted, "sqlite batch committed");
        }
        Ok(())
    }

    async fn get_object(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let hash = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT content FROM objects WHERE hash = ?1 LIMIT 1",
                params![hash],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
        .map_err(|e| TransportError::read(&self.name, id, e))
    }

    async fn has_objects(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, bool>> {
        let Some(first) = ids.first() else {
            return Ok(HashMap::new());
        };
        let hashes: Vec<String> = ids.iter().map(ObjectId::to_string).collect();
        let found = self
            .with_conn(move |conn| {
                let mut found: HashSet<String> = HashSet::new();
                for chunk in hashes.chunks(EXISTENCE_CHUNK) {
                    let placeholders = vec!["?"; chunk.len()].join(",");
                    let sql = format!("SELECT hash FROM objects WHERE hash IN ({placeholders})");
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
                    for hash in rows {
                        found.insert(hash?);
                    }
                }
                Ok(found)
            })
            .await
            .map_err(|e| TransportError::read(&self.name, first, e))?;
        Ok(ids
            .iter()
            .map(|id| (id.clone(), found.contains(id.as_str())))
            .collect())
    }

    async fn write_complete(&self) -> TransportResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for SqliteTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransport")
            .field("path", &self.path)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn oid(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    fn open(dir: &TempDir) -> SqliteTransport {
        SqliteTransport::new(&SqliteConfig {
            base_path: dir.path().to_path_buf(),
            application_name: "KeelTests".to_string(),
            scope: "Objects".to_string(),
            batch_size: 100,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn database_lives_under_application_dir() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        assert_eq!(db.path(), dir.path().join("KeelTests").join("Objects.db"));
        assert!(db.path().exists());
        let ctx = db.context();
        assert_eq!(ctx["type"], "sqlite");
        assert_eq!(ctx["location"], db.path().display().to_string());
    }

    #[tokio::test]
    async fn save_get_and_check_existence() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.save_object(&oid("MyTestObjectId"), "MyTestObjectData").await.unwrap();
        db.write_complete().await.unwrap();

        assert_eq!(
            db.get_object(&oid("MyTestObjectId")).await.unwrap().as_deref(),
            Some("MyTestObjectData")
        );
        let found = db.has_objects(&[oid("MyTestObjectId"), oid("other")]).await.unwrap();
        assert!(found[&oid("MyTestObjectId")]);
        assert!(!found[&oid("other")]);
    }

    #[tokio::test]
    async fn insert_is_idempotent_and_first_wins() {
        let db = SqliteTransport::in_memory().unwrap();
        db.save_object(&oid("a"), "first").await.unwrap();
        db.save_object(&oid("a"), "second").await.unwrap();
        assert_eq!(db.require_object(&oid("a")).await.unwrap(), "first");
        assert_eq!(db.saved_count(), 1);
        assert_eq!(db.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn batches_span_several_transactions() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let records: Vec<Record> = (0..1234)
            .map(|i| Record::new(oid(&format!("id{i:05}")), format!("p{i}")))
            .collect();
        db.save_objects(&records).await.unwrap();
        assert_eq!(db.len().unwrap(), 1234);

        let ids: Vec<ObjectId> = records.iter().map(|r| r.id.clone()).collect();
        let found = db.has_objects(&ids).await.unwrap();
        assert_eq!(found.len(), 1234);
        assert!(found.values().all(|present| *present));
    }

    #[tokio::test]
    async fn cancelled_batch_reports_committed_ids() {
        let db = SqliteTransport::in_memory().unwrap();
        db.hooks().cancel.cancel();
        let records = vec![Record::new(oid("a"), "x")];
        let err = db.save_objects(&records).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled { ref completed, .. } if completed.is_empty()));
        assert_eq!(db.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_writes_reach_the_error_hook() {
        let failed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failed);
        let db = SqliteTransport::in_memory()
            .unwrap()
            .with_hooks(TransportHooks::new().with_error_handler(move |_, ids, _| {
                sink.lock().unwrap().extend_from_slice(ids);
            }));
        db.conn.lock().unwrap().execute_batch("DROP TABLE objects").unwrap();

        let err = db.save_object(&oid("single"), "x").await.unwrap_err();
        assert!(matches!(err, TransportError::Write { .. }));
        let records = vec![Record::new(oid("b1"), "x"), Record::new(oid("b2"), "y")];
        let err = db.save_objects(&records).await.unwrap_err();
        assert!(err.durable_ids().is_empty());

        assert_eq!(*failed.lock().unwrap(), vec![oid("single"), oid("b1"), oid("b2")]);
    }

    #[tokio::test]
    async fn maintenance_operations() {
        let db = SqliteTransport::in_memory().unwrap();
        db.save_object(&oid("b"), "2").await.unwrap();
        db.save_object(&oid("a"), "1").await.unwrap();

        db.update_object(&oid("a"), "1-updated").unwrap();
        assert_eq!(db.require_object(&oid("a")).await.unwrap(), "1-updated");

        let all = db.all_objects().unwrap();
        assert_eq!(all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        assert!(db.delete_object(&oid("b")).unwrap());
        assert!(!db.delete_object(&oid("b")).unwrap());

        db.clear().unwrap();
        assert_eq!(db.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn reopening_sees_previous_records() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.save_object(&oid("kept"), "data").await.unwrap();
        }
        let db = open(&dir);
        assert_eq!(db.get_object(&oid("kept")).await.unwrap().as_deref(), Some("data"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(open(&dir));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    db.save_object(&oid(&format!("w{worker}-{i}")), "data").await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        db.write_complete().await.unwrap();
        assert_eq!(db.len().unwrap(), 400);
    }
}
