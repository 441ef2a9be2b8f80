/// Catalog migrations, applied in order. The catalog's `PRAGMA user_version`
/// records how many have run, so entries must never be edited or reordered
/// once released; append a new one instead.
pub const MIGRATIONS: &[&str] = &[
    // 1: initial layout
    r#"
-- Files: stable content id <-> surrogate key
CREATE TABLE IF NOT EXISTS files (
    hash_id INTEGER PRIMARY KEY,
    file_hash TEXT NOT NULL UNIQUE
);

-- Fingerprints: serialized hasher output, shared by every file that produced it
CREATE TABLE IF NOT EXISTS fingerprints (
    phash_id INTEGER PRIMARY KEY,
    phash BLOB NOT NULL UNIQUE
);

-- At most one live fingerprint per file
CREATE TABLE IF NOT EXISTS file_fingerprints (
    hash_id INTEGER PRIMARY KEY,
    phash_id INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_fingerprints_phash ON file_fingerprints(phash_id);

-- VP-tree arena keyed by fingerprint. NULL radius marks a leaf.
CREATE TABLE IF NOT EXISTS vptree_nodes (
    phash_id INTEGER PRIMARY KEY,
    parent_id INTEGER,
    radius INTEGER,
    inner_id INTEGER,
    inner_population INTEGER NOT NULL DEFAULT 0,
    outer_id INTEGER,
    outer_population INTEGER NOT NULL DEFAULT 0
);

-- Branch roots whose inner/outer split has drifted out of balance
CREATE TABLE IF NOT EXISTS maintenance_queue (
    phash_id INTEGER PRIMARY KEY
);

-- How far each file's neighbourhood has been searched. NULL = never.
CREATE TABLE IF NOT EXISTS search_cache (
    hash_id INTEGER PRIMARY KEY,
    searched_distance INTEGER
);

-- Fingerprints computed but not yet merged into the tree
CREATE TABLE IF NOT EXISTS ingest_queue (
    file_hash TEXT PRIMARY KEY,
    phash BLOB NOT NULL
);
"#,
    // 2: lookups used by the scanner and branch gathering
    r#"
CREATE INDEX IF NOT EXISTS idx_search_cache_distance ON search_cache(searched_distance);
CREATE INDEX IF NOT EXISTS idx_vptree_nodes_parent ON vptree_nodes(parent_id);
"#,
];

/// Schema version a catalog is at once every migration has been applied.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;
