use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::records::{ChapterInsert, Chunk, ChunkInsert, DocumentInsert, DocumentRecord};
use crate::DocumentStore;

/// SQLite-backed document/chunk repository. Every call opens its own connection, so a
/// clone can be handed to each request or worker thread.
#[derive(Clone)]
pub struct GuidelineStore {
    path: PathBuf,
}

impl GuidelineStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("failed to open store {}", self.path.display()))
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                title TEXT,
                source TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                section_heading TEXT NOT NULL,
                content TEXT NOT NULL,
                summary TEXT,
                chapter_summary TEXT,
                position_in_doc INTEGER NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(document_id) REFERENCES documents(id)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_document_heading
                ON chunks(document_id, section_heading);
            "#,
        )?;
        Ok(())
    }

    /// Liveness probe: true when the store answers a trivial query.
    pub fn ping(&self) -> bool {
        let Ok(conn) = self.connection() else {
            return false;
        };
        conn.query_row("SELECT id FROM documents LIMIT 1", [], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .is_ok()
    }

    pub fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.connection()?;
        let doc = conn
            .query_row(
                "SELECT id, title, source, created_at FROM documents WHERE id = ?1 LIMIT 1",
                [id],
                |row| {
                    Ok(DocumentRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        source: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(doc)
    }

    /// Inserts the document, or refreshes its metadata and drops its old chunks when the
    /// id already exists.
    pub fn upsert_document(&self, doc: &DocumentInsert) -> Result<DocumentRecord> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO documents (id, title, source) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, source = excluded.source",
            params![doc.id, doc.title, doc.source],
        )?;
        let dropped = tx.execute("DELETE FROM chunks WHERE document_id = ?1", [&doc.id])?;
        tx.commit()?;
        if dropped > 0 {
            debug!(document_id = %doc.id, dropped, "replaced existing chunks");
        }
        self.get_document(&doc.id)?
            .with_context(|| format!("document {} missing after insert", doc.id))
    }

    pub fn add_chunk(&self, chunk: &ChunkInsert) -> Result<i64> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO chunks (document_id, section_heading, content, summary, position_in_doc) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chunk.document_id,
                chunk.section_heading,
                chunk.content,
                chunk.summary,
                chunk.position_in_doc
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Writes a document and all of its chunks in one transaction, replacing whatever was
    /// stored under the same id. Nothing changes if any insert fails.
    pub fn replace_document(
        &self,
        doc: &DocumentInsert,
        chapters: &[ChapterInsert],
    ) -> Result<Vec<i64>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO documents (id, title, source) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, source = excluded.source",
            params![doc.id, doc.title, doc.source],
        )?;
        let dropped = tx.execute("DELETE FROM chunks WHERE document_id = ?1", [&doc.id])?;
        let mut ids = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (document_id, section_heading, content, summary, chapter_summary, position_in_doc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chapter in chapters {
                for chunk in &chapter.chunks {
                    stmt.execute(params![
                        doc.id,
                        chunk.section_heading,
                        chunk.content,
                        chunk.summary,
                        chapter.summary,
                        chunk.position_in_doc
                    ])?;
                    ids.push(tx.last_insert_rowid());
                }
            }
        }
        tx.commit()?;
        debug!(document_id = %doc.id, dropped, written = ids.len(), "replaced document chunks");
        Ok(ids)
    }

    pub fn chapter_summary(&self, chunk_id: i64) -> Result<Option<String>> {
        let conn = self.connection()?;
        let summary = conn
            .query_row(
                "SELECT chapter_summary FROM chunks WHERE id = ?1",
                [chunk_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(summary.flatten())
    }

    /// Case-insensitive substring match over chunk content.
    pub fn search_chunks(
        &self,
        query: &str,
        top_k: usize,
        document_id: Option<&str>,
    ) -> Result<Vec<Chunk>> {
        let query = query.trim();
        if query.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", escape_like(query));
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, document_id, section_heading, content
            FROM chunks
            WHERE content LIKE ?1 ESCAPE '\'
              AND (?2 IS NULL OR document_id = ?2)
            ORDER BY document_id, position_in_doc, id
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![pattern, document_id, top_k as i64], chunk_from_row)?;
        let hits = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }
}

impl DocumentStore for GuidelineStore {
    fn pick_default_document(&self) -> Result<Option<String>> {
        let conn = self.connection()?;
        let id = conn
            .query_row("SELECT id FROM documents LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn list_headings(&self, document_id: &str) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT section_heading FROM chunks WHERE document_id = ?1
             GROUP BY section_heading ORDER BY MIN(position_in_doc)",
        )?;
        let rows = stmt.query_map([document_id], |row| row.get::<_, String>(0))?;
        let headings = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(headings)
    }

    fn fetch_chunks(&self, document_id: &str, headings: &[String]) -> Result<Vec<Chunk>> {
        if headings.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..headings.len())
            .map(|idx| format!("?{}", idx + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, document_id, section_heading, content FROM chunks
             WHERE document_id = ?1 AND section_heading IN ({placeholders})
             ORDER BY position_in_doc, id"
        );
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let values = std::iter::once(document_id).chain(headings.iter().map(String::as_str));
        let rows = stmt.query_map(params_from_iter(values), chunk_from_row)?;
        let chunks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        section_heading: row.get(2)?,
        content: row.get(3)?,
    })
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_a\\b"), "50\\%\\_a\\\\b");
        assert_eq!(escape_like("plain"), "plain");
    }
}
