//! Versioned catalog migrations.
//!
//! The applied version lives in SQLite's `PRAGMA user_version`. A catalog
//! written by a newer build is refused outright; an older one is brought up
//! to date before anything else touches it.

use rusqlite::Connection;
use tracing::info;

use super::schema::{MIGRATIONS, SCHEMA_VERSION};
use crate::error::{Error, Result};

pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Apply every pending migration. Returns the number applied.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    let mut applied = 0;
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as u32;
        if version <= current {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;

        info!(version, "Applied catalog migration");
        applied += 1;
    }
    Ok(applied)
}
