use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use crate::error::Result;
use crate::types::{FileKind, UploadedFile};

/// Store for `UploadedFile` bindings: platform handle <-> LLM-files-API
/// handle. Plain pass-through over SQLite — files are registered at most a
/// few times per message, so no cache layer is warranted here.
pub struct FileStore {
    db: Mutex<Connection>,
}

impl FileStore {
    pub fn new(conn: Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }

    /// Register a freshly downloaded platform file, before it has been
    /// uploaded to the LLM files API.
    #[instrument(skip(self), fields(platform_file_id, mime_type))]
    pub fn register(
        &self,
        platform_file_id: &str,
        mime_type: &str,
        kind: FileKind,
        message_id: Option<i64>,
        ttl_secs: i64,
    ) -> Result<UploadedFile> {
        let now = Utc::now();
        let expires_at = (now + chrono::Duration::seconds(ttl_secs)).to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO user_files
             (platform_file_id, llm_file_id, mime_type, kind, message_id, expires_at, created_at)
             VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6)",
            params![
                platform_file_id,
                mime_type,
                kind.to_string(),
                message_id,
                expires_at,
                now.to_rfc3339(),
            ],
        )?;
        let id = db.last_insert_rowid();
        db.query_row(
            "SELECT id, platform_file_id, llm_file_id, mime_type, kind, message_id,
                    expires_at, created_at
             FROM user_files WHERE id = ?1",
            params![id],
            row_to_file,
        )
        .map_err(Into::into)
    }

    /// Attach the LLM-files-API handle once the upload completes.
    pub fn mark_uploaded(&self, id: i64, llm_file_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE user_files SET llm_file_id = ?1 WHERE id = ?2",
            params![llm_file_id, id],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<UploadedFile>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, platform_file_id, llm_file_id, mime_type, kind, message_id,
                    expires_at, created_at
             FROM user_files WHERE id = ?1",
            params![id],
            row_to_file,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn for_message(&self, message_id: i64) -> Result<Vec<UploadedFile>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, platform_file_id, llm_file_id, mime_type, kind, message_id,
                    expires_at, created_at
             FROM user_files WHERE message_id = ?1",
        )?;
        let rows = stmt.query_map(params![message_id], row_to_file)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadedFile> {
    let kind_str: String = row.get(4)?;
    Ok(UploadedFile {
        id: row.get(0)?,
        platform_file_id: row.get(1)?,
        llm_file_id: row.get(2)?,
        mime_type: row.get(3)?,
        kind: kind_str.parse().unwrap_or(FileKind::Document),
        message_id: row.get(5)?,
        expires_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> FileStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        FileStore::new(conn)
    }

    #[test]
    fn register_then_mark_uploaded() {
        let store = open_store();
        let file = store
            .register("tg-file-1", "image/png", FileKind::Image, Some(7), 3600)
            .unwrap();
        assert!(file.llm_file_id.is_none());

        store.mark_uploaded(file.id, "files-api-9").unwrap();
        let reloaded = store.get(file.id).unwrap().unwrap();
        assert_eq!(reloaded.llm_file_id.as_deref(), Some("files-api-9"));
    }

    #[test]
    fn for_message_returns_all_attachments() {
        let store = open_store();
        store.register("f1", "image/png", FileKind::Image, Some(5), 3600).unwrap();
        store.register("f2", "application/pdf", FileKind::Pdf, Some(5), 3600).unwrap();
        store.register("f3", "image/png", FileKind::Image, Some(6), 3600).unwrap();

        let files = store.for_message(5).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn is_expired_reflects_ttl() {
        let store = open_store();
        let file = store
            .register("f1", "image/png", FileKind::Image, None, -10)
            .unwrap();
        assert!(file.is_expired(Utc::now()));
    }
}
