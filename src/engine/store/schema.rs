//! SQLite schema and connection factory for the graph store.

use std::path::Path;

use rusqlite::Connection;

use crate::engine::error::EngineError;

/// Schema version stored in `PRAGMA user_version`.
/// Increment when the DDL changes; add a migration path in `init_db`.
pub(crate) const SCHEMA_VERSION: i64 = 1;

/// Execute the v1 schema DDL.
///
/// - `chunks`, `entities`, `relationships`: the extracted graph.
/// - `extractions`: ledger of chunks already merged into the graph.
/// - `communities` + `community_generations`: every detection run writes a
///   new generation; only the generation named by the pointer is visible.
/// - `tree_nodes` + `tree_builds`: same scheme for summary tree rebuilds.
/// - `vectors`: the embedded vector index, one row per embedded record.
pub(crate) fn init_schema(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            sequence_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS chunks_group ON chunks(group_id);

        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            description TEXT NOT NULL,
            mention_count INTEGER NOT NULL,
            UNIQUE (group_id, normalized_name, entity_type)
        );

        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            source_entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            target_entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            descriptions TEXT NOT NULL,
            weight REAL NOT NULL,
            UNIQUE (group_id, source_entity_id, target_entity_id)
        );

        CREATE TABLE IF NOT EXISTS extractions (
            group_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            PRIMARY KEY (group_id, chunk_id)
        );

        CREATE TABLE IF NOT EXISTS communities (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            generation TEXT NOT NULL,
            level INTEGER NOT NULL,
            entity_ids TEXT NOT NULL,
            parent_id TEXT,
            summary TEXT NOT NULL,
            rank REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS communities_group ON communities(group_id, generation);

        CREATE TABLE IF NOT EXISTS community_generations (
            group_id TEXT PRIMARY KEY,
            generation TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tree_nodes (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            build_id TEXT NOT NULL,
            level INTEGER NOT NULL,
            text TEXT NOT NULL,
            children TEXT NOT NULL,
            parent_node_id TEXT
        );
        CREATE INDEX IF NOT EXISTS tree_nodes_group ON tree_nodes(group_id, build_id);

        CREATE TABLE IF NOT EXISTS tree_builds (
            group_id TEXT PRIMARY KEY,
            build_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS vectors (
            kind TEXT NOT NULL,
            record_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            dimension INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (kind, record_id)
        );
        CREATE INDEX IF NOT EXISTS vectors_group ON vectors(kind, group_id);

        PRAGMA user_version = 1;
        ",
    )
    .map_err(|e| EngineError::Storage(format!("graph_store: initialize schema: {e}")))
}

/// Bring a database up to `SCHEMA_VERSION`. Safe to call on every open.
pub(crate) fn init_db(conn: &Connection) -> Result<(), EngineError> {
    let version: i64 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .map_err(|e| EngineError::Storage(format!("graph_store: read user_version: {e}")))?;
    if version < SCHEMA_VERSION {
        init_schema(conn)?;
    }
    Ok(())
}

/// Open a SQLite connection and apply the standard pragmas:
/// WAL journal, foreign keys on, 5 s busy timeout.
pub(crate) fn open_conn(db_path: &Path) -> Result<Connection, EngineError> {
    let conn = Connection::open(db_path).map_err(|e| {
        EngineError::Storage(format!("graph_store: open {}: {e}", db_path.display()))
    })?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| EngineError::Storage(format!("graph_store: set journal_mode WAL: {e}")))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| EngineError::Storage(format!("graph_store: set foreign_keys ON: {e}")))?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|e| EngineError::Storage(format!("graph_store: set busy_timeout: {e}")))?;

    Ok(conn)
}
