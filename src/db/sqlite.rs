//! SQLite catalog implementation.

use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::migrate::{run_migrations, schema_version};
use super::{Catalog, CatalogStats, NodeView, QueuedFingerprint, Side, TreeNode};
use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// Ids per `IN (...)` list, well under SQLite's bound-parameter limit.
const ID_CHUNK: usize = 500;

pub struct SqliteCatalog {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn, path: None })
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Run `sql` once per chunk of `ids`, with `{ids}` replaced by the
    /// chunk's placeholders.
    fn query_ids<T, F>(&self, sql: &str, ids: &[i64], mut map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = sql.replace("{ids}", &placeholders(chunk.len()));
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), &mut map)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    fn execute_ids(&self, sql: &str, ids: &[i64]) -> Result<usize> {
        let mut changed = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = sql.replace("{ids}", &placeholders(chunk.len()));
            changed += self
                .conn
                .prepare_cached(&sql)?
                .execute(params_from_iter(chunk.iter()))?;
        }
        Ok(changed)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn fingerprint_from(row: &Row<'_>, idx: usize) -> rusqlite::Result<Fingerprint> {
    Ok(Fingerprint::from_bytes(row.get::<_, Vec<u8>>(idx)?))
}

impl Catalog for SqliteCatalog {
    // ========================================================================
    // Transactions
    // ========================================================================

    fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    // ========================================================================
    // Schema
    // ========================================================================

    fn initialize(&self) -> Result<()> {
        run_migrations(&self.conn)?;
        Ok(())
    }

    fn schema_version(&self) -> Result<u32> {
        schema_version(&self.conn)
    }

    // ========================================================================
    // Files
    // ========================================================================

    fn add_file(&self, file_hash: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO files (file_hash) VALUES (?)",
            [file_hash],
        )?;
        let id = self.conn.query_row(
            "SELECT hash_id FROM files WHERE file_hash = ?",
            [file_hash],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn file_id(&self, file_hash: &str) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT hash_id FROM files WHERE file_hash = ?",
            [file_hash],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn file_hash(&self, hash_id: i64) -> Result<Option<String>> {
        let result = self.conn.query_row(
            "SELECT file_hash FROM files WHERE hash_id = ?",
            [hash_id],
            |row| row.get(0),
        );
        match result {
            Ok(hash) => Ok(Some(hash)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_file(&self, file_hash: &str) -> Result<bool> {
        self.conn
            .execute("DELETE FROM ingest_queue WHERE file_hash = ?", [file_hash])?;
        let Some(hash_id) = self.file_id(file_hash)? else {
            return Ok(false);
        };
        self.conn
            .execute("DELETE FROM file_fingerprints WHERE hash_id = ?", [hash_id])?;
        self.conn
            .execute("DELETE FROM search_cache WHERE hash_id = ?", [hash_id])?;
        self.conn
            .execute("DELETE FROM files WHERE hash_id = ?", [hash_id])?;
        Ok(true)
    }

    fn fingerprinted_files(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT f.file_hash
            FROM file_fingerprints m
            JOIN files f ON f.hash_id = m.hash_id
            UNION
            SELECT file_hash FROM ingest_queue
            "#,
        )?;
        let hashes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(hashes)
    }

    // ========================================================================
    // Fingerprints
    // ========================================================================

    fn add_fingerprint(&self, fingerprint: &Fingerprint) -> Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO fingerprints (phash) VALUES (?)",
            [fingerprint.as_bytes()],
        )?;
        let id = self.conn.query_row(
            "SELECT phash_id FROM fingerprints WHERE phash = ?",
            [fingerprint.as_bytes()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn fingerprint_id(&self, fingerprint: &Fingerprint) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT phash_id FROM fingerprints WHERE phash = ?",
            [fingerprint.as_bytes()],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn fingerprints(&self, phash_ids: &[i64]) -> Result<Vec<(i64, Fingerprint)>> {
        self.query_ids(
            "SELECT phash_id, phash FROM fingerprints WHERE phash_id IN ({ids})",
            phash_ids,
            |row| Ok((row.get(0)?, fingerprint_from(row, 1)?)),
        )
    }

    fn delete_fingerprints(&self, phash_ids: &[i64]) -> Result<()> {
        self.execute_ids("DELETE FROM fingerprints WHERE phash_id IN ({ids})", phash_ids)?;
        Ok(())
    }

    // ========================================================================
    // File -> fingerprint map
    // ========================================================================

    fn associate(&self, hash_id: i64, phash_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM file_fingerprints WHERE hash_id = ?", [hash_id])?;
        self.conn.execute(
            "INSERT INTO file_fingerprints (hash_id, phash_id) VALUES (?, ?)",
            params![hash_id, phash_id],
        )?;
        self.conn.execute(
            "INSERT OR REPLACE INTO search_cache (hash_id, searched_distance) VALUES (?, NULL)",
            [hash_id],
        )?;
        Ok(())
    }

    fn fingerprint_of_file(&self, hash_id: i64) -> Result<Option<(i64, Fingerprint)>> {
        let result = self.conn.query_row(
            r#"
            SELECT m.phash_id, p.phash
            FROM file_fingerprints m
            JOIN fingerprints p ON p.phash_id = m.phash_id
            WHERE m.hash_id = ?
            "#,
            [hash_id],
            |row| Ok((row.get(0)?, fingerprint_from(row, 1)?)),
        );
        match result {
            Ok(found) => Ok(Some(found)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn files_with_fingerprints(&self, phash_ids: &[i64]) -> Result<Vec<(i64, i64)>> {
        self.query_ids(
            "SELECT phash_id, hash_id FROM file_fingerprints WHERE phash_id IN ({ids})",
            phash_ids,
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    fn mapped_among(&self, phash_ids: &[i64]) -> Result<HashSet<i64>> {
        let ids = self.query_ids(
            "SELECT DISTINCT phash_id FROM file_fingerprints WHERE phash_id IN ({ids})",
            phash_ids,
            |row| row.get(0),
        )?;
        Ok(ids.into_iter().collect())
    }

    fn mapped_fingerprints(&self) -> Result<Vec<(i64, Fingerprint)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.phash_id, p.phash
            FROM fingerprints p
            WHERE EXISTS (SELECT 1 FROM file_fingerprints m WHERE m.phash_id = p.phash_id)
            ORDER BY p.phash_id
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, fingerprint_from(row, 1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn prune_orphans(&self) -> Result<usize> {
        self.conn.execute_batch(
            r#"
            DELETE FROM file_fingerprints WHERE hash_id NOT IN (SELECT hash_id FROM files);
            DELETE FROM search_cache WHERE hash_id NOT IN (SELECT hash_id FROM files);
            "#,
        )?;
        let removed = self.conn.execute(
            "DELETE FROM fingerprints WHERE phash_id NOT IN (SELECT phash_id FROM file_fingerprints)",
            [],
        )?;
        Ok(removed)
    }

    // ========================================================================
    // VP-tree nodes
    // ========================================================================

    fn root_id(&self) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT phash_id FROM vptree_nodes WHERE parent_id IS NULL ORDER BY phash_id LIMIT 1",
            [],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn tree_node(&self, phash_id: i64) -> Result<Option<(TreeNode, Fingerprint)>> {
        let result = self.conn.query_row(
            r#"
            SELECT n.phash_id, n.parent_id, n.radius,
                   n.inner_id, n.inner_population, n.outer_id, n.outer_population,
                   p.phash
            FROM vptree_nodes n
            JOIN fingerprints p ON p.phash_id = n.phash_id
            WHERE n.phash_id = ?
            "#,
            [phash_id],
            |row| {
                Ok((
                    TreeNode {
                        phash_id: row.get(0)?,
                        parent_id: row.get(1)?,
                        radius: row.get(2)?,
                        inner_id: row.get(3)?,
                        inner_population: row.get(4)?,
                        outer_id: row.get(5)?,
                        outer_population: row.get(6)?,
                    },
                    fingerprint_from(row, 7)?,
                ))
            },
        );
        match result {
            Ok(node) => Ok(Some(node)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn node_views(&self, phash_ids: &[i64]) -> Result<Vec<(i64, NodeView)>> {
        self.query_ids(
            r#"
            SELECT n.phash_id, p.phash, n.radius, n.inner_id, n.outer_id
            FROM vptree_nodes n
            JOIN fingerprints p ON p.phash_id = n.phash_id
            WHERE n.phash_id IN ({ids})
            "#,
            phash_ids,
            |row| {
                Ok((
                    row.get(0)?,
                    NodeView {
                        fingerprint: fingerprint_from(row, 1)?,
                        radius: row.get(2)?,
                        inner_id: row.get(3)?,
                        outer_id: row.get(4)?,
                    },
                ))
            },
        )
    }

    fn has_node(&self, phash_id: i64) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM vptree_nodes WHERE phash_id = ?)",
            [phash_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn put_nodes(&self, nodes: &[TreeNode]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT OR REPLACE INTO vptree_nodes
                (phash_id, parent_id, radius, inner_id, inner_population, outer_id, outer_population)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )?;
        for node in nodes {
            stmt.execute(params![
                node.phash_id,
                node.parent_id,
                node.radius,
                node.inner_id,
                node.inner_population,
                node.outer_id,
                node.outer_population,
            ])?;
        }
        Ok(())
    }

    fn link_child(&self, parent_id: i64, side: Side, child_id: i64, radius: u32) -> Result<()> {
        match side {
            Side::Inner => self.conn.execute(
                "UPDATE vptree_nodes SET inner_id = ?, radius = COALESCE(radius, ?) WHERE phash_id = ?",
                params![child_id, radius, parent_id],
            )?,
            Side::Outer => self.conn.execute(
                "UPDATE vptree_nodes SET outer_id = ? WHERE phash_id = ?",
                params![child_id, parent_id],
            )?,
        };
        Ok(())
    }

    fn set_child(&self, parent_id: i64, side: Side, child_id: Option<i64>, population: u32) -> Result<()> {
        let sql = match side {
            Side::Inner => "UPDATE vptree_nodes SET inner_id = ?, inner_population = ? WHERE phash_id = ?",
            Side::Outer => "UPDATE vptree_nodes SET outer_id = ?, outer_population = ? WHERE phash_id = ?",
        };
        self.conn
            .execute(sql, params![child_id, population, parent_id])?;
        Ok(())
    }

    fn add_populations(&self, inner: &[i64], outer: &[i64]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE vptree_nodes SET inner_population = inner_population + 1 WHERE phash_id = ?",
        )?;
        for id in inner {
            stmt.execute([id])?;
        }
        let mut stmt = self.conn.prepare_cached(
            "UPDATE vptree_nodes SET outer_population = outer_population + 1 WHERE phash_id = ?",
        )?;
        for id in outer {
            stmt.execute([id])?;
        }
        Ok(())
    }

    fn branch_ids(&self, root_id: i64) -> Result<Vec<i64>> {
        // UNION rather than UNION ALL so a corrupted, cyclic parent chain terminates
        let mut stmt = self.conn.prepare_cached(
            r#"
            WITH RECURSIVE branch(phash_id) AS (
                SELECT ?
                UNION
                SELECT n.phash_id
                FROM vptree_nodes n
                JOIN branch b ON n.parent_id = b.phash_id
            )
            SELECT b.phash_id
            FROM branch b
            JOIN vptree_nodes n ON n.phash_id = b.phash_id
            "#,
        )?;
        let ids = stmt
            .query_map([root_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn delete_nodes(&self, phash_ids: &[i64]) -> Result<()> {
        self.execute_ids("DELETE FROM vptree_nodes WHERE phash_id IN ({ids})", phash_ids)?;
        Ok(())
    }

    fn clear_tree(&self) -> Result<()> {
        self.conn.execute("DELETE FROM vptree_nodes", [])?;
        Ok(())
    }

    fn tree_size(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM vptree_nodes")
    }

    // ========================================================================
    // Maintenance queue
    // ========================================================================

    fn enqueue_maintenance(&self, phash_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO maintenance_queue (phash_id) VALUES (?)",
            [phash_id],
        )?;
        Ok(())
    }

    fn largest_pending_branch(&self) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            r#"
            SELECT q.phash_id
            FROM maintenance_queue q
            JOIN vptree_nodes n ON n.phash_id = q.phash_id
            ORDER BY n.inner_population + n.outer_population DESC, q.phash_id
            LIMIT 1
            "#,
            [],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn maintenance_len(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM maintenance_queue")
    }

    fn dequeue_maintenance(&self, phash_ids: &[i64]) -> Result<()> {
        self.execute_ids("DELETE FROM maintenance_queue WHERE phash_id IN ({ids})", phash_ids)?;
        Ok(())
    }

    fn clear_maintenance(&self) -> Result<()> {
        self.conn.execute("DELETE FROM maintenance_queue", [])?;
        Ok(())
    }

    // ========================================================================
    // Search cache
    // ========================================================================

    fn pending_searches(&self, distance: u32) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT hash_id FROM search_cache
            WHERE searched_distance IS NULL OR searched_distance < ?
            ORDER BY hash_id
            "#,
        )?;
        let ids = stmt
            .query_map([distance], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn count_pending_searches(&self, distance: u32, limit: usize) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*) FROM (
                SELECT 1 FROM search_cache
                WHERE searched_distance IS NULL OR searched_distance < ?
                LIMIT ?
            )
            "#,
            params![distance, limit as i64],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn mark_searched(&self, hash_id: i64, distance: u32) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO search_cache (hash_id, searched_distance) VALUES (?1, ?2)
            ON CONFLICT(hash_id) DO UPDATE
            SET searched_distance = MAX(COALESCE(searched_distance, 0), excluded.searched_distance)
            "#,
            params![hash_id, distance],
        )?;
        Ok(())
    }

    fn clear_search_cache(&self) -> Result<()> {
        self.conn
            .execute("UPDATE search_cache SET searched_distance = NULL", [])?;
        Ok(())
    }

    // ========================================================================
    // Ingest queue
    // ========================================================================

    fn enqueue_ingest(&self, file_hash: &str, fingerprint: &Fingerprint) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO ingest_queue (file_hash, phash) VALUES (?, ?)",
            params![file_hash, fingerprint.as_bytes()],
        )?;
        Ok(())
    }

    fn next_ingest_batch(&self, limit: usize) -> Result<Vec<QueuedFingerprint>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT file_hash, phash FROM ingest_queue ORDER BY rowid LIMIT ?")?;
        let batch = stmt
            .query_map([limit as i64], |row| {
                Ok(QueuedFingerprint {
                    file_hash: row.get(0)?,
                    fingerprint: fingerprint_from(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batch)
    }

    fn dequeue_ingest(&self, file_hash: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM ingest_queue WHERE file_hash = ?", [file_hash])?;
        Ok(())
    }

    fn ingest_queue_len(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM ingest_queue")
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    fn clear_search_tree(&self) -> Result<usize> {
        let requeued = self.conn.execute(
            r#"
            INSERT OR REPLACE INTO ingest_queue (file_hash, phash)
            SELECT f.file_hash, p.phash
            FROM file_fingerprints m
            JOIN files f ON f.hash_id = m.hash_id
            JOIN fingerprints p ON p.phash_id = m.phash_id
            "#,
            [],
        )?;
        self.conn.execute_batch(
            r#"
            DELETE FROM vptree_nodes;
            DELETE FROM maintenance_queue;
            DELETE FROM search_cache;
            "#,
        )?;
        Ok(requeued)
    }

    fn stats(&self) -> Result<CatalogStats> {
        let size_bytes = match &self.path {
            Some(path) => Some(std::fs::metadata(path)?.len()),
            None => None,
        };
        Ok(CatalogStats {
            files: self.count("SELECT COUNT(*) FROM file_fingerprints")?,
            fingerprints: self.count("SELECT COUNT(*) FROM fingerprints")?,
            tree_nodes: self.tree_size()?,
            ingest_queue: self.ingest_queue_len()?,
            maintenance_queue: self.maintenance_len()?,
            unsearched_files: self
                .count("SELECT COUNT(*) FROM search_cache WHERE searched_distance IS NULL")?,
            size_bytes,
        })
    }
}
