//! Database schema definitions.

/// Schema of the vector store database.
pub const DENSE_SCHEMA: &str = r#"
-- Collections table; the dimension is fixed by the first write.
-- vec_indexed marks collections mirrored into a sqlite-vec table.
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    dimension INTEGER NOT NULL,
    vec_indexed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

-- Dense entries, embeddings stored as little-endian f32 blobs
CREATE TABLE IF NOT EXISTS dense_entries (
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    chunk_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    text TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (collection, chunk_id)
);

CREATE INDEX IF NOT EXISTS idx_dense_document ON dense_entries(collection, document_id);
"#;

/// Schema of the document store database.
pub const SPARSE_SCHEMA: &str = r#"
-- Collections table
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- Sparse entries; BM25 statistics are derived from text at query time
CREATE TABLE IF NOT EXISTS sparse_entries (
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    chunk_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    text TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (collection, chunk_id)
);

CREATE INDEX IF NOT EXISTS idx_sparse_document ON sparse_entries(collection, document_id);
"#;

/// Name of the sqlite-vec table mirroring a collection.
pub fn vec_table(collection_rowid: i64) -> String {
    format!("vec_{}", collection_rowid)
}

/// Schema for a collection's sqlite-vec virtual table.
/// This must be created after the extension is registered.
pub fn vec_schema(table: &str, dimension: usize) -> String {
    format!(
        r#"
CREATE VIRTUAL TABLE IF NOT EXISTS {table} USING vec0(
    chunk_id TEXT PRIMARY KEY,
    embedding float[{dimension}] distance_metric=cosine
);
"#,
        table = table,
        dimension = dimension,
    )
}

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 2;
