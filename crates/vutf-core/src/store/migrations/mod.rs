//! Store schema migrations
//!
//! SQL migrations are embedded as strings. Each store records the last
//! applied version in `PRAGMA user_version`; opening a store applies the
//! newer ones in order, each in its own transaction.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Core tables SQL (001)
pub const CORE_TABLES_SQL: &str = include_str!("001_core_tables.sql");

/// Score key scoped to the execution (002)
pub const SCORE_KEY_SQL: &str = include_str!("002_score_key_per_execution.sql");

const MIGRATIONS: &[(u32, &str)] = &[(1, CORE_TABLES_SQL), (2, SCORE_KEY_SQL)];

/// Latest schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Schema version recorded in the store
pub fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Run all pending store migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;

    for &(version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!(version, "Applied store migration");
    }

    Ok(())
}
