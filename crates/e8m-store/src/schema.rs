use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB instead of the default ~4MB
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Fold stale WAL data into the main DB on startup. In-memory and fresh
    // databases legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    // Vectors are little-endian f64 blobs; rotors are four REAL columns.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS roots (
            id     INTEGER PRIMARY KEY,
            coords BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projection (
            id            INTEGER PRIMARY KEY CHECK (id = 1),
            input_dim     INTEGER NOT NULL,
            lattice_scale REAL NOT NULL,
            vals          BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS nodes (
            id              INTEGER PRIMARY KEY,
            raw_embedding   BLOB NOT NULL,
            lattice_coord   BLOB NOT NULL,
            nearest_root_id INTEGER NOT NULL,
            shell           INTEGER NOT NULL,
            rotor_w         REAL NOT NULL,
            rotor_x         REAL NOT NULL,
            rotor_y         REAL NOT NULL,
            rotor_z         REAL NOT NULL,
            entropy         REAL NOT NULL,
            created_at      INTEGER NOT NULL,
            q_infinity      REAL NOT NULL,
            s_q             REAL NOT NULL,
            state           TEXT NOT NULL DEFAULT 'active',
            state_ref       INTEGER
        );

        CREATE TABLE IF NOT EXISTS edges (
            src     INTEGER NOT NULL REFERENCES nodes(id),
            dst     INTEGER NOT NULL,
            weight  REAL NOT NULL,
            rotor_w REAL NOT NULL,
            rotor_x REAL NOT NULL,
            rotor_y REAL NOT NULL,
            rotor_z REAL NOT NULL,
            PRIMARY KEY (src, dst)
        );

        CREATE TABLE IF NOT EXISTS lineage (
            summary  INTEGER NOT NULL,
            position INTEGER NOT NULL,
            member   INTEGER NOT NULL,
            PRIMARY KEY (summary, position)
        );

        CREATE TABLE IF NOT EXISTS lineage_reseeds (
            summary INTEGER PRIMARY KEY,
            reseeds INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_shell ON nodes(shell);
        CREATE INDEX IF NOT EXISTS idx_nodes_state ON nodes(state);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        for table in &[
            "metadata",
            "roots",
            "projection",
            "nodes",
            "edges",
            "lineage",
            "lineage_reseeds",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert!(count >= 0, "table {table} should exist");
        }
    }

    #[test]
    fn test_schema_version_set() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_wal_mode_enabled() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        // In-memory always reports "memory", on-disk reports "wal"
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert!(mode == "memory" || mode == "wal", "got mode: {mode}");
    }

    #[test]
    fn test_wal_mode_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("memory.db")).unwrap();
        initialize(&conn).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_idempotent_initialize() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
    }

    #[test]
    fn test_busy_timeout_set() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000, "busy_timeout should be 5000ms");
    }

    #[test]
    fn test_single_projection_row() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        conn.execute(
            "INSERT INTO projection (id, input_dim, lattice_scale, vals) VALUES (1, 8, 1.0, x'')",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO projection (id, input_dim, lattice_scale, vals) VALUES (2, 8, 1.0, x'')",
            [],
        );
        assert!(second.is_err());
    }
}
