//! Stand-alone vector store used by the `external` backend.
//!
//! Holds only `(kind, record_id, group_id, vector)` rows in its own SQLite
//! file; record content stays in the graph store.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};

use crate::engine::error::EngineError;
use crate::engine::model::{GroupId, RecordKind};
use crate::engine::store::{StoredVector, decode_embedding, encode_embedding};

fn db(ctx: &'static str) -> impl Fn(rusqlite::Error) -> EngineError {
    move |e| EngineError::Storage(format!("external_index: {ctx}: {e}"))
}

/// One row replaced by `put_many`: the previous `(group_id, dimension, blob)`,
/// or `None` when the row was new.
#[derive(Debug)]
pub(crate) struct Overwritten {
    kind: RecordKind,
    record_id: String,
    previous: Option<(String, i64, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct ExternalVectorStore {
    path: PathBuf,
}

impl ExternalVectorStore {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Storage(format!("external_index: create {}: {e}", parent.display()))
            })?;
        }
        let store = Self { path: path.to_path_buf() };
        store
            .conn()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS vectors (
                    kind TEXT NOT NULL,
                    record_id TEXT NOT NULL,
                    group_id TEXT NOT NULL,
                    dimension INTEGER NOT NULL,
                    embedding BLOB NOT NULL,
                    PRIMARY KEY (kind, record_id)
                );
                CREATE INDEX IF NOT EXISTS vectors_group ON vectors(kind, group_id);",
            )
            .map_err(db("initialize schema"))?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection, EngineError> {
        let conn = Connection::open(&self.path).map_err(db("open"))?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db("set journal_mode WAL"))?;
        conn.pragma_update(None, "busy_timeout", 5000).map_err(db("set busy_timeout"))?;
        Ok(conn)
    }

    /// Write a batch of vectors of one kind in one transaction. Returns what
    /// each row replaced, for [`ExternalVectorStore::restore`].
    pub(crate) fn put_many(
        &self,
        kind: RecordKind,
        group: &GroupId,
        rows: &[(&str, &[f32])],
    ) -> Result<Vec<Overwritten>, EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin put"))?;
        let mut undo = Vec::with_capacity(rows.len());
        for (record_id, embedding) in rows {
            let previous = tx
                .query_row(
                    "SELECT group_id, dimension, embedding FROM vectors
                     WHERE kind = ?1 AND record_id = ?2",
                    params![kind.as_str(), record_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
                .map_err(db("read previous vector"))?;
            tx.execute(
                "INSERT OR REPLACE INTO vectors (kind, record_id, group_id, dimension, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    kind.as_str(),
                    record_id,
                    group.as_str(),
                    embedding.len() as i64,
                    encode_embedding(embedding)
                ],
            )
            .map_err(db("write vector"))?;
            undo.push(Overwritten { kind, record_id: record_id.to_string(), previous });
        }
        tx.commit().map_err(db("commit put"))?;
        Ok(undo)
    }

    /// Put back what earlier `put_many` calls replaced: rows that were new
    /// are deleted, overwritten rows get their old vector again.
    pub(crate) fn restore(&self, undo: &[Overwritten]) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin restore"))?;
        for u in undo {
            match &u.previous {
                None => tx.execute(
                    "DELETE FROM vectors WHERE kind = ?1 AND record_id = ?2",
                    params![u.kind.as_str(), u.record_id],
                ),
                Some((group_id, dimension, blob)) => tx.execute(
                    "INSERT OR REPLACE INTO vectors (kind, record_id, group_id, dimension, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![u.kind.as_str(), u.record_id, group_id, dimension, blob],
                ),
            }
            .map_err(db("restore vector"))?;
        }
        tx.commit().map_err(db("commit restore"))
    }

    pub(crate) fn delete(&self, kind: RecordKind, ids: &[String]) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin delete"))?;
        for id in ids {
            tx.execute(
                "DELETE FROM vectors WHERE kind = ?1 AND record_id = ?2",
                params![kind.as_str(), id],
            )
            .map_err(db("delete vector"))?;
        }
        tx.commit().map_err(db("commit delete"))
    }

    pub fn delete_group(&self, group: &GroupId) -> Result<(), EngineError> {
        self.conn()?
            .execute("DELETE FROM vectors WHERE group_id = ?1", params![group.as_str()])
            .map_err(db("purge group"))?;
        Ok(())
    }

    pub(crate) fn vectors_for(
        &self,
        kind: RecordKind,
        group: &GroupId,
    ) -> Result<Vec<StoredVector>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT record_id, group_id, dimension, embedding FROM vectors
                 WHERE kind = ?1 AND group_id = ?2",
            )
            .map_err(db("prepare scan"))?;
        let rows = stmt
            .query_map(params![kind.as_str(), group.as_str()], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(db("scan vectors"))?;
        let mut out = Vec::new();
        for row in rows {
            let (record_id, group_id, dimension, blob) = row.map_err(db("read vector row"))?;
            let embedding = decode_embedding(&blob, dimension.max(0) as usize)?;
            out.push(StoredVector { record_id, group_id, embedding });
        }
        Ok(out)
    }

    pub fn count(&self, kind: RecordKind, group: &GroupId) -> Result<usize, EngineError> {
        let n: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM vectors WHERE kind = ?1 AND group_id = ?2",
                params![kind.as_str(), group.as_str()],
                |r| r.get(0),
            )
            .map_err(db("count"))?;
        Ok(n.max(0) as usize)
    }
}
