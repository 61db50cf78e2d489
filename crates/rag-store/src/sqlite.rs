//! SQLite-based storage implementation.

use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use rag_core::{
    ChunkId, DenseEntry, DocumentStore, Metadata, RagError, Result, ScoredChunk,
    SimilarityMetric, SparseEntry, StorageConfig, StoreKind, VectorStore,
};

use crate::rank::rank;
use crate::schema::{vec_schema, vec_table, DENSE_SCHEMA, SCHEMA_VERSION, SPARSE_SCHEMA};

/// Largest `k` a vec0 KNN query accepts.
const VEC_MAX_K: usize = 4096;

static VEC_EXTENSION: Once = Once::new();

/// Register sqlite-vec for every connection opened afterwards.
fn register_vec_extension() {
    VEC_EXTENSION.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// Map a SQLite error onto the engine's error kinds.
///
/// Lock contention and I/O failures are transient and retried. Everything
/// else is internal.
fn sql_err(kind: StoreKind, e: rusqlite::Error) -> RagError {
    match e.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::FileLockingProtocolFailed,
        ) => RagError::store(kind, e.to_string()),
        _ => RagError::internal(format!("{} store: {}", kind, e)),
    }
}

/// Connection pragmas.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub wal_mode: bool,
    pub cache_size: i32,
    pub busy_timeout_ms: u32,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            wal_mode: true,
            cache_size: -64000,
            busy_timeout_ms: 5000,
        }
    }
}

impl From<&StorageConfig> for SqliteOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            wal_mode: config.wal_mode,
            cache_size: config.cache_size,
            busy_timeout_ms: config.busy_timeout_ms,
        }
    }
}

/// A single SQLite connection guarded by a blocking Mutex.
///
/// Every statement runs on the blocking thread pool via `spawn_blocking`, so
/// a caller's timeout returns control while SQLite is still waiting on a lock.
#[derive(Clone)]
struct Database {
    conn: Arc<Mutex<Connection>>,
    kind: StoreKind,
}

impl Database {
    fn open(path: &Path, kind: StoreKind, schema: &str, options: &SqliteOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RagError::store(kind, format!("Failed to open database: {}", e)))?;

        let db = Self::init(conn, kind, schema, options)?;
        info!(store = %kind, "Database opened at {:?}", path);
        Ok(db)
    }

    fn open_memory(kind: StoreKind, schema: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            RagError::store(kind, format!("Failed to open in-memory database: {}", e))
        })?;
        let options = SqliteOptions {
            wal_mode: false,
            ..SqliteOptions::default()
        };
        Self::init(conn, kind, schema, &options)
    }

    fn init(conn: Connection, kind: StoreKind, schema: &str, options: &SqliteOptions) -> Result<Self> {
        let journal = if options.wal_mode { "WAL" } else { "DELETE" };
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode = {journal};
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = {cache};
            PRAGMA busy_timeout = {busy};
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
            journal = journal,
            cache = options.cache_size,
            busy = options.busy_timeout_ms,
        ))
        .map_err(|e| RagError::store(kind, format!("Failed to configure connection: {}", e)))?;

        conn.execute_batch(schema)
            .map_err(|e| RagError::store(kind, format!("Failed to initialize schema: {}", e)))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| RagError::store(kind, format!("Failed to set schema version: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            kind,
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let kind = self.kind;
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| RagError::internal(format!("{} store connection poisoned: {}", kind, e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RagError::internal(format!("{} store task failed: {}", kind, e)))?
    }

    async fn ids_with_prefix(&self, table: &'static str, collection: &str, prefix: &str) -> Result<Vec<ChunkId>> {
        let kind = self.kind;
        let collection = collection.to_string();
        let prefix = prefix.to_string();
        self.call(move |conn| select_ids_with_prefix(conn, kind, table, &collection, &prefix))
            .await
    }

    async fn delete_prefix(&self, table: &'static str, collection: &str, prefix: &str) -> Result<usize> {
        let kind = self.kind;
        let collection = collection.to_string();
        let prefix = prefix.to_string();
        self.call(move |conn| {
            if !collection_exists(conn, kind, &collection)? {
                return Err(RagError::collection_not_found(collection));
            }
            let deleted = delete_rows_with_prefix(conn, kind, table, &collection, &prefix)?;
            debug!(store = %kind, collection, prefix, deleted, "Deleted entries");
            Ok(deleted)
        })
        .await
    }

    async fn count(&self, table: &'static str, collection: &str) -> Result<usize> {
        let kind = self.kind;
        let collection = collection.to_string();
        self.call(move |conn| {
            let count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {} WHERE collection = ?1", table),
                    params![collection],
                    |row| row.get(0),
                )
                .map_err(|e| sql_err(kind, e))?;
            Ok(count as usize)
        })
        .await
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let kind = self.kind;
        let collection = collection.to_string();
        self.call(move |conn| {
            // Entries are deleted by CASCADE
            let deleted = conn
                .execute("DELETE FROM collections WHERE name = ?1", params![collection])
                .map_err(|e| sql_err(kind, e))?;
            if deleted == 0 {
                return Err(RagError::collection_not_found(collection));
            }
            debug!(store = %kind, "Dropped collection: {}", collection);
            Ok(())
        })
        .await
    }
}

/// Begin a transaction that takes the write lock up front, so lock waits go
/// through the busy handler instead of failing on upgrade.
fn write_transaction(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

fn collection_exists(conn: &Connection, kind: StoreKind, collection: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM collections WHERE name = ?1",
        params![collection],
        |_| Ok(()),
    )
    .optional()
    .map(|r| r.is_some())
    .map_err(|e| sql_err(kind, e))
}

fn select_ids_with_prefix(
    conn: &Connection,
    kind: StoreKind,
    table: &str,
    collection: &str,
    prefix: &str,
) -> Result<Vec<ChunkId>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT chunk_id FROM {} WHERE collection = ?1 AND substr(chunk_id, 1, length(?2)) = ?2 ORDER BY chunk_id",
            table
        ))
        .map_err(|e| sql_err(kind, e))?;
    let ids = stmt
        .query_map(params![collection, prefix], |row| row.get::<_, String>(0))
        .map_err(|e| sql_err(kind, e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| sql_err(kind, e))?;
    Ok(ids.into_iter().map(ChunkId::from_raw).collect())
}

fn delete_rows_with_prefix(
    conn: &Connection,
    kind: StoreKind,
    table: &str,
    collection: &str,
    prefix: &str,
) -> Result<usize> {
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE collection = ?1 AND substr(chunk_id, 1, length(?2)) = ?2",
            table
        ),
        params![collection, prefix],
    )
    .map_err(|e| sql_err(kind, e))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Convert f32 vector to bytes (little-endian).
fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert little-endian bytes back to an f32 vector.
fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// A collection row of the vector store.
struct DenseCollection {
    rowid: i64,
    dimension: usize,
    vec_indexed: bool,
}

impl DenseCollection {
    fn lookup(conn: &Connection, collection: &str) -> Result<Option<Self>> {
        conn.query_row(
            "SELECT rowid, dimension, vec_indexed FROM collections WHERE name = ?1",
            params![collection],
            |row| {
                Ok(Self {
                    rowid: row.get(0)?,
                    dimension: row.get::<_, i64>(1)? as usize,
                    vec_indexed: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| sql_err(StoreKind::Dense, e))
    }

    fn vec_table(&self) -> Option<String> {
        self.vec_indexed.then(|| vec_table(self.rowid))
    }
}

/// Vector store backed by SQLite.
///
/// Cosine queries go through a per-collection sqlite-vec `vec0` table when
/// the extension is available; other metrics, and databases without the
/// extension, fall back to an exact scan of the stored embeddings.
pub struct SqliteVectorStore {
    db: Database,
    vec_enabled: bool,
}

impl SqliteVectorStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &SqliteOptions::default())
    }

    /// Open with explicit connection options.
    pub fn open_with(path: impl AsRef<Path>, options: &SqliteOptions) -> Result<Self> {
        register_vec_extension();
        Self::with_database(Database::open(path.as_ref(), StoreKind::Dense, DENSE_SCHEMA, options)?)
    }

    /// Open the database named by the storage configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::open_with(&config.dense_path, &SqliteOptions::from(config))
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        register_vec_extension();
        Self::with_database(Database::open_memory(StoreKind::Dense, DENSE_SCHEMA)?)
    }

    fn with_database(db: Database) -> Result<Self> {
        let vec_enabled = {
            let conn = db
                .conn
                .lock()
                .map_err(|e| RagError::internal(e.to_string()))?;
            conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
                .map(|version| info!(version, "sqlite-vec extension loaded"))
                .is_ok()
        };
        if !vec_enabled {
            warn!("sqlite-vec extension not available - using exact scan");
        }
        Ok(Self { db, vec_enabled })
    }

    /// Check if sqlite-vec search is available.
    pub fn vec_enabled(&self) -> bool {
        self.vec_enabled
    }

    async fn scan_nearest(
        &self,
        collection: String,
        query: Vec<f32>,
        top_n: usize,
        metric: SimilarityMetric,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = self
            .db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT chunk_id, embedding, text, metadata FROM dense_entries WHERE collection = ?1",
                    )
                    .map_err(|e| sql_err(StoreKind::Dense, e))?;
                let rows = stmt
                    .query_map(params![collection], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })
                    .map_err(|e| sql_err(StoreKind::Dense, e))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| sql_err(StoreKind::Dense, e))?;
                Ok(rows)
            })
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for (chunk_id, blob, text, metadata) in rows {
            let embedding = bytes_to_vec(&blob);
            hits.push(ScoredChunk {
                chunk_id: ChunkId::from_raw(chunk_id),
                score: metric.score(&query, &embedding),
                text,
                metadata: serde_json::from_str::<Metadata>(&metadata)?,
            });
        }
        Ok(rank(hits, top_n))
    }

    async fn vec_nearest(
        &self,
        collection: String,
        table: String,
        query: Vec<f32>,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = self
            .db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        r#"
                        WITH knn AS (
                            SELECT chunk_id, distance
                            FROM {table}
                            WHERE embedding MATCH ?1 AND k = ?2
                        )
                        SELECT knn.chunk_id, knn.distance, d.text, d.metadata
                        FROM knn
                        JOIN dense_entries d ON d.collection = ?3 AND d.chunk_id = knn.chunk_id
                        "#,
                        table = table
                    ))
                    .map_err(|e| sql_err(StoreKind::Dense, e))?;
                let rows = stmt
                    .query_map(params![vec_to_bytes(&query), top_n as i64, collection], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })
                    .map_err(|e| sql_err(StoreKind::Dense, e))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| sql_err(StoreKind::Dense, e))?;
                Ok(rows)
            })
            .await?;

        let hits = rows
            .into_iter()
            .map(|(chunk_id, distance, text, metadata)| -> Result<ScoredChunk> {
                Ok(ScoredChunk {
                    chunk_id: ChunkId::from_raw(chunk_id),
                    score: 1.0 - distance as f32,
                    text,
                    metadata: serde_json::from_str(&metadata)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(rank(hits, top_n))
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, collection: &str, entries: &[DenseEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let first_len = first.embedding.len();

        let rows = entries
            .iter()
            .map(|e| -> Result<(String, String, Vec<u8>, usize, String, String)> {
                Ok((
                    e.chunk_id.as_str().to_string(),
                    e.document_id.clone(),
                    vec_to_bytes(&e.embedding),
                    e.embedding.len(),
                    e.text.clone(),
                    serde_json::to_string(&e.metadata)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let collection = collection.to_string();
        let vec_enabled = self.vec_enabled;
        let err = |e| sql_err(StoreKind::Dense, e);

        self.db
            .call(move |conn| {
                let tx = write_transaction(conn).map_err(err)?;

                let existing = DenseCollection::lookup(&tx, &collection)?;
                let expected = existing.as_ref().map_or(first_len, |c| c.dimension);
                if let Some(bad) = rows.iter().find(|r| r.3 != expected) {
                    return Err(RagError::DimensionMismatch {
                        expected,
                        actual: bad.3,
                    });
                }

                let vec = match existing {
                    Some(c) => c.vec_table(),
                    None => {
                        tx.execute(
                            "INSERT INTO collections (name, dimension, vec_indexed, created_at) VALUES (?1, ?2, ?3, ?4)",
                            params![collection, expected as i64, vec_enabled, now_secs()],
                        )
                        .map_err(err)?;
                        if vec_enabled {
                            let table = vec_table(tx.last_insert_rowid());
                            tx.execute_batch(&vec_schema(&table, expected)).map_err(err)?;
                            Some(table)
                        } else {
                            None
                        }
                    }
                };

                {
                    let mut stmt = tx
                        .prepare(
                            r#"
                            INSERT OR REPLACE INTO dense_entries
                                (collection, chunk_id, document_id, embedding, text, metadata)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                            "#,
                        )
                        .map_err(err)?;
                    for (chunk_id, document_id, blob, _, text, metadata) in &rows {
                        stmt.execute(params![collection, chunk_id, document_id, blob, text, metadata])
                            .map_err(err)?;
                    }
                }

                if let Some(table) = &vec {
                    // vec0 has no INSERT OR REPLACE
                    let mut delete = tx
                        .prepare(&format!("DELETE FROM {} WHERE chunk_id = ?1", table))
                        .map_err(err)?;
                    let mut insert = tx
                        .prepare(&format!("INSERT INTO {} (chunk_id, embedding) VALUES (?1, ?2)", table))
                        .map_err(err)?;
                    for (chunk_id, _, blob, _, _, _) in &rows {
                        delete.execute(params![chunk_id]).map_err(err)?;
                        insert.execute(params![chunk_id, blob]).map_err(err)?;
                    }
                }

                tx.commit().map_err(err)?;
                debug!(collection, vec = vec.is_some(), "Upserted {} dense entries", rows.len());
                Ok(())
            })
            .await
    }

    async fn delete_prefix(&self, collection: &str, prefix: &str) -> Result<usize> {
        let collection = collection.to_string();
        let prefix = prefix.to_string();
        let err = |e| sql_err(StoreKind::Dense, e);

        self.db
            .call(move |conn| {
                let tx = write_transaction(conn).map_err(err)?;
                let Some(info) = DenseCollection::lookup(&tx, &collection)? else {
                    return Err(RagError::collection_not_found(collection));
                };

                if let Some(table) = info.vec_table() {
                    let ids = select_ids_with_prefix(&tx, StoreKind::Dense, "dense_entries", &collection, &prefix)?;
                    let mut delete = tx
                        .prepare(&format!("DELETE FROM {} WHERE chunk_id = ?1", table))
                        .map_err(err)?;
                    for id in &ids {
                        delete.execute(params![id.as_str()]).map_err(err)?;
                    }
                }
                let deleted =
                    delete_rows_with_prefix(&tx, StoreKind::Dense, "dense_entries", &collection, &prefix)?;

                tx.commit().map_err(err)?;
                debug!(store = %StoreKind::Dense, collection, prefix, deleted, "Deleted entries");
                Ok(deleted)
            })
            .await
    }

    async fn ids_with_prefix(&self, collection: &str, prefix: &str) -> Result<Vec<ChunkId>> {
        self.db.ids_with_prefix("dense_entries", collection, prefix).await
    }

    async fn nearest(
        &self,
        collection: &str,
        query: &[f32],
        top_n: usize,
        metric: SimilarityMetric,
    ) -> Result<Vec<ScoredChunk>> {
        let name = collection.to_string();
        let Some(info) = self
            .db
            .call(move |conn| DenseCollection::lookup(conn, &name))
            .await?
        else {
            return Ok(Vec::new());
        };
        if info.dimension != query.len() {
            return Err(RagError::DimensionMismatch {
                expected: info.dimension,
                actual: query.len(),
            });
        }

        let zero_query = query.iter().all(|x| *x == 0.0);
        match info.vec_table() {
            Some(table)
                if self.vec_enabled
                    && metric == SimilarityMetric::Cosine
                    && !zero_query
                    && top_n <= VEC_MAX_K =>
            {
                self.vec_nearest(collection.to_string(), table, query.to_vec(), top_n)
                    .await
            }
            _ => {
                self.scan_nearest(collection.to_string(), query.to_vec(), top_n, metric)
                    .await
            }
        }
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        self.db.count("dense_entries", collection).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let collection = collection.to_string();
        let err = |e| sql_err(StoreKind::Dense, e);

        self.db
            .call(move |conn| {
                let tx = write_transaction(conn).map_err(err)?;
                let Some(info) = DenseCollection::lookup(&tx, &collection)? else {
                    return Err(RagError::collection_not_found(collection));
                };
                if let Some(table) = info.vec_table() {
                    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", table))
                        .map_err(err)?;
                }
                // Entries are deleted by CASCADE
                tx.execute("DELETE FROM collections WHERE name = ?1", params![collection])
                    .map_err(err)?;
                tx.commit().map_err(err)?;
                debug!(store = %StoreKind::Dense, "Dropped collection: {}", collection);
                Ok(())
            })
            .await
    }
}

/// Document store backed by SQLite.
pub struct SqliteDocumentStore {
    db: Database,
}

impl SqliteDocumentStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &SqliteOptions::default())
    }

    /// Open with explicit connection options.
    pub fn open_with(path: impl AsRef<Path>, options: &SqliteOptions) -> Result<Self> {
        Ok(Self {
            db: Database::open(path.as_ref(), StoreKind::Sparse, SPARSE_SCHEMA, options)?,
        })
    }

    /// Open the database named by the storage configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::open_with(&config.sparse_path, &SqliteOptions::from(config))
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_memory(StoreKind::Sparse, SPARSE_SCHEMA)?,
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn upsert(&self, collection: &str, entries: &[SparseEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let rows = entries
            .iter()
            .map(|e| -> Result<(String, String, String, String)> {
                Ok((
                    e.chunk_id.as_str().to_string(),
                    e.document_id.clone(),
                    e.text.clone(),
                    serde_json::to_string(&e.metadata)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let collection = collection.to_string();
        let err = |e| sql_err(StoreKind::Sparse, e);

        self.db
            .call(move |conn| {
                let tx = write_transaction(conn).map_err(err)?;
                tx.execute(
                    "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
                    params![collection, now_secs()],
                )
                .map_err(err)?;

                {
                    let mut stmt = tx
                        .prepare(
                            r#"
                            INSERT OR REPLACE INTO sparse_entries
                                (collection, chunk_id, document_id, text, metadata)
                            VALUES (?1, ?2, ?3, ?4, ?5)
                            "#,
                        )
                        .map_err(err)?;

                    for (chunk_id, document_id, text, metadata) in &rows {
                        stmt.execute(params![collection, chunk_id, document_id, text, metadata])
                            .map_err(err)?;
                    }
                }

                tx.commit().map_err(err)?;
                debug!(collection, "Upserted {} sparse entries", rows.len());
                Ok(())
            })
            .await
    }

    async fn delete_prefix(&self, collection: &str, prefix: &str) -> Result<usize> {
        self.db.delete_prefix("sparse_entries", collection, prefix).await
    }

    async fn ids_with_prefix(&self, collection: &str, prefix: &str) -> Result<Vec<ChunkId>> {
        self.db.ids_with_prefix("sparse_entries", collection, prefix).await
    }

    async fn scan(&self, collection: &str) -> Result<Vec<SparseEntry>> {
        let collection = collection.to_string();
        let err = |e| sql_err(StoreKind::Sparse, e);

        let rows = self
            .db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        r#"
                        SELECT chunk_id, document_id, text, metadata
                        FROM sparse_entries
                        WHERE collection = ?1
                        ORDER BY chunk_id
                        "#,
                    )
                    .map_err(err)?;
                let rows = stmt
                    .query_map(params![collection], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })
                    .map_err(err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(err)?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(chunk_id, document_id, text, metadata)| -> Result<SparseEntry> {
                Ok(SparseEntry {
                    chunk_id: ChunkId::from_raw(chunk_id),
                    document_id,
                    text,
                    metadata: serde_json::from_str(&metadata)?,
                })
            })
            .collect()
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        self.db.count("sparse_entries", collection).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.db.drop_collection(collection).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::memory::MemoryVectorStore;
    use rag_core::MetadataValue;

    fn dense(doc: &str, idx: u32, embedding: Vec<f32>) -> DenseEntry {
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), MetadataValue::from(doc));
        DenseEntry {
            chunk_id: ChunkId::new(doc, idx),
            document_id: doc.to_string(),
            embedding,
            text: format!("{} chunk {}", doc, idx),
            metadata,
        }
    }

    fn sparse(doc: &str, idx: u32, words: &[&str]) -> SparseEntry {
        SparseEntry {
            chunk_id: ChunkId::new(doc, idx),
            document_id: doc.to_string(),
            text: words.join(" "),
            metadata: Metadata::new(),
        }
    }

    fn ids(hits: &[ScoredChunk]) -> Vec<&str> {
        hits.iter().map(|h| h.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_blob_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(bytes_to_vec(&vec_to_bytes(&v)), v);
    }

    #[test]
    fn test_error_classification() {
        let failure = |code| rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None);

        for code in [rusqlite::ffi::SQLITE_BUSY, rusqlite::ffi::SQLITE_LOCKED, rusqlite::ffi::SQLITE_IOERR] {
            let err = sql_err(StoreKind::Dense, failure(code));
            assert!(err.is_transient(), "{}", err);
            assert_eq!(err.error_code(), "STORE_UNAVAILABLE");
        }

        for e in [
            failure(rusqlite::ffi::SQLITE_CONSTRAINT),
            failure(rusqlite::ffi::SQLITE_MISMATCH),
            rusqlite::Error::QueryReturnedNoRows,
        ] {
            let err = sql_err(StoreKind::Sparse, e);
            assert!(!err.is_transient(), "{}", err);
            assert_eq!(err.error_code(), "INTERNAL_ERROR");
        }
    }

    #[tokio::test]
    async fn test_malformed_sql_is_not_transient() {
        let store = SqliteDocumentStore::open_memory().unwrap();
        let err = store
            .db
            .call(|conn| {
                conn.execute_batch("SELEC nonsense")
                    .map_err(|e| sql_err(StoreKind::Sparse, e))
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_open_memory() {
        let store = SqliteVectorStore::open_memory().unwrap();
        assert_eq!(store.count("kb").await.unwrap(), 0);
        assert!(store.nearest("kb", &[1.0], 3, SimilarityMetric::Cosine).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dense_upsert_and_nearest() {
        let store = SqliteVectorStore::open_memory().unwrap();
        store
            .upsert(
                "kb",
                &[
                    dense("a", 0, vec![1.0, 0.0]),
                    dense("a", 1, vec![0.0, 1.0]),
                    dense("b", 0, vec![0.7, 0.7]),
                ],
            )
            .await
            .unwrap();

        let hits = store.nearest("kb", &[1.0, 0.1], 2, SimilarityMetric::Cosine).await.unwrap();
        assert_eq!(ids(&hits), vec!["a:0", "b:0"]);
        assert_eq!(hits[0].metadata.get("source"), Some(&MetadataValue::from("a")));

        // Replace by id
        store.upsert("kb", &[dense("a", 0, vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(store.count("kb").await.unwrap(), 3);
        let hits = store.nearest("kb", &[1.0, 0.0], 1, SimilarityMetric::Cosine).await.unwrap();
        assert_eq!(hits[0].chunk_id.as_str(), "b:0");
    }

    #[tokio::test]
    async fn test_vec_search_matches_exact_scan() {
        let store = SqliteVectorStore::open_memory().unwrap();
        assert!(store.vec_enabled());

        let entries = vec![
            dense("a", 0, vec![1.0, 0.0, 0.0]),
            dense("a", 1, vec![0.6, 0.8, 0.0]),
            dense("b", 0, vec![0.0, 0.0, 1.0]),
            dense("c", 0, vec![0.5, 0.5, 0.5]),
        ];
        store.upsert("kb", &entries).await.unwrap();
        let exact = MemoryVectorStore::new();
        exact.upsert("kb", &entries).await.unwrap();

        let query = [0.9, 0.3, 0.1];
        let hits = store.nearest("kb", &query, 3, SimilarityMetric::Cosine).await.unwrap();
        let expected = exact.nearest("kb", &query, 3, SimilarityMetric::Cosine).await.unwrap();
        assert_eq!(ids(&hits), ids(&expected));
        for (hit, want) in hits.iter().zip(&expected) {
            assert!((hit.score - want.score).abs() < 1e-4);
            assert_eq!(hit.text, want.text);
        }

        // deletes reach the vec0 table
        store.delete_prefix("kb", "a:").await.unwrap();
        let hits = store.nearest("kb", &query, 3, SimilarityMetric::Cosine).await.unwrap();
        assert_eq!(ids(&hits), vec!["c:0", "b:0"]);
    }

    #[tokio::test]
    async fn test_inner_product_uses_exact_scan() {
        let store = SqliteVectorStore::open_memory().unwrap();
        store
            .upsert("kb", &[dense("a", 0, vec![1.0, 0.0]), dense("b", 0, vec![3.0, 0.0])])
            .await
            .unwrap();

        let hits = store
            .nearest("kb", &[1.0, 0.0], 2, SimilarityMetric::InnerProduct)
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec!["b:0", "a:0"]);
        assert!((hits[0].score - 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dropped_collection_takes_new_dimension() {
        let store = SqliteVectorStore::open_memory().unwrap();
        store.upsert("kb", &[dense("a", 0, vec![1.0, 0.0])]).await.unwrap();
        store.drop_collection("kb").await.unwrap();

        store.upsert("kb", &[dense("a", 0, vec![0.0, 0.0, 1.0])]).await.unwrap();
        let hits = store.nearest("kb", &[0.0, 0.0, 1.0], 5, SimilarityMetric::Cosine).await.unwrap();
        assert_eq!(ids(&hits), vec!["a:0"]);
    }

    #[tokio::test]
    async fn test_dimension_is_fixed_by_first_write() {
        let store = SqliteVectorStore::open_memory().unwrap();
        store.upsert("kb", &[dense("a", 0, vec![1.0, 0.0])]).await.unwrap();
        let err = store.upsert("kb", &[dense("a", 1, vec![1.0, 0.0, 0.0])]).await.unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 3 }));
        let err = store
            .nearest("kb", &[1.0], 1, SimilarityMetric::Cosine)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_prefix_operations() {
        let store = SqliteVectorStore::open_memory().unwrap();
        store
            .upsert(
                "kb",
                &[
                    dense("doc1", 0, vec![1.0]),
                    dense("doc1", 1, vec![1.0]),
                    dense("doc10", 0, vec![1.0]),
                ],
            )
            .await
            .unwrap();

        let ids = store.ids_with_prefix("kb", "doc1:").await.unwrap();
        assert_eq!(ids, vec![ChunkId::new("doc1", 0), ChunkId::new("doc1", 1)]);
        assert_eq!(store.delete_prefix("kb", "doc1:").await.unwrap(), 2);
        assert_eq!(store.count("kb").await.unwrap(), 1);

        assert!(store.ids_with_prefix("other", "doc1:").await.unwrap().is_empty());
        assert!(matches!(
            store.delete_prefix("other", "doc1:").await,
            Err(RagError::CollectionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_drop_collection() {
        let store = SqliteDocumentStore::open_memory().unwrap();
        store.upsert("kb", &[sparse("a", 0, &["x"])]).await.unwrap();
        store.drop_collection("kb").await.unwrap();
        assert_eq!(store.count("kb").await.unwrap(), 0);
        assert!(store.drop_collection("kb").await.is_err());
    }

    #[tokio::test]
    async fn test_sparse_scan_orders_by_chunk_id() {
        let store = SqliteDocumentStore::open_memory().unwrap();
        store
            .upsert(
                "kb",
                &[sparse("b", 0, &["fox", "dog"]), sparse("a", 0, &["fox", "fox", "quick"])],
            )
            .await
            .unwrap();
        store.upsert("other", &[sparse("c", 0, &["cat"])]).await.unwrap();

        let entries = store.scan("kb").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].chunk_id.as_str(), "a:0");
        assert_eq!(entries[0].text, "fox fox quick");
        assert!(store.scan("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dense.db");

        {
            let store = SqliteVectorStore::open(&path).unwrap();
            store.upsert("kb", &[dense("a", 0, vec![0.5, 0.5])]).await.unwrap();
        }

        let store = SqliteVectorStore::open(&path).unwrap();
        assert_eq!(store.count("kb").await.unwrap(), 1);
        let hits = store
            .nearest("kb", &[0.5, 0.5], 5, SimilarityMetric::InnerProduct)
            .await
            .unwrap();
        assert!((hits[0].score - 0.5).abs() < 1e-6);
        let hits = store
            .nearest("kb", &[0.5, 0.5], 5, SimilarityMetric::Cosine)
            .await
            .unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-4);
    }

    /// Hold the write lock on `path` from a second connection.
    fn lock_database(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        conn
    }

    #[tokio::test]
    async fn test_caller_timeout_preempts_busy_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.db");
        let options = SqliteOptions {
            busy_timeout_ms: 2000,
            ..SqliteOptions::default()
        };
        let store = SqliteDocumentStore::open_with(&path, &options).unwrap();
        let holder = lock_database(&path);

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            store.upsert("kb", &[sparse("a", 0, &["fox"])]),
        )
        .await;
        assert!(result.is_err(), "upsert should still be waiting on the lock");
        assert!(started.elapsed() < Duration::from_millis(1000));

        holder.execute_batch("COMMIT").unwrap();
    }

    #[tokio::test]
    async fn test_locked_database_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.db");
        let options = SqliteOptions {
            busy_timeout_ms: 20,
            ..SqliteOptions::default()
        };
        let store = SqliteDocumentStore::open_with(&path, &options).unwrap();
        let holder = lock_database(&path);

        let err = store
            .upsert("kb", &[sparse("a", 0, &["fox"])])
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{}", err);
        assert!(matches!(err, RagError::StoreUnavailable { store: StoreKind::Sparse, .. }));

        holder.execute_batch("COMMIT").unwrap();
        store.upsert("kb", &[sparse("a", 0, &["fox"])]).await.unwrap();
        assert_eq!(store.count("kb").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dense_and_sparse_calls_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteOptions {
            busy_timeout_ms: 300,
            ..SqliteOptions::default()
        };
        let dense_path = dir.path().join("dense.db");
        let sparse_path = dir.path().join("sparse.db");
        let dense_store = SqliteVectorStore::open_with(&dense_path, &options).unwrap();
        let sparse_store = SqliteDocumentStore::open_with(&sparse_path, &options).unwrap();
        let dense_lock = lock_database(&dense_path);
        let sparse_lock = lock_database(&sparse_path);

        // both legs wait out their busy timeout in parallel
        let dense_records = [dense("a", 0, vec![1.0])];
        let sparse_records = [sparse("a", 0, &["fox"])];
        let started = Instant::now();
        let (dense, sparse) = tokio::join!(
            dense_store.upsert("kb", &dense_records),
            sparse_store.upsert("kb", &sparse_records),
        );
        assert!(dense.is_err() && sparse.is_err());
        assert!(started.elapsed() < Duration::from_millis(550));

        dense_lock.execute_batch("COMMIT").unwrap();
        sparse_lock.execute_batch("COMMIT").unwrap();
    }
}
