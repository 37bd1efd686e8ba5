//! File metadata table.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::sqlite::{open_connection, retry_busy, vacuum};
use super::{FileEntry, RowId};
use crate::error::StoreError;
use crate::tile::{Size, TileFormat};

const FILES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS files (
        fileid INTEGER PRIMARY KEY AUTOINCREMENT,
        url    TEXT UNIQUE,
        size   INTEGER,
        mtime  INTEGER,
        format INTEGER,
        width  INTEGER,
        height INTEGER
    );
";

const SELECT_COLUMNS: &str = "SELECT fileid, url, size, mtime, format, width, height FROM files";

/// The `files` table: one row per resolved source URL.
pub struct FileDatabase {
    conn: Connection,
}

impl FileDatabase {
    /// Open the table in the database at `path`, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        debug!(path = %path.display(), "Opening file database");
        Self::with_connection(open_connection(Some(path))?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(open_connection(None)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(FILES_SCHEMA)?;
        Ok(Self { conn })
    }

    /// Look up the entry for `url`.
    pub fn get_file_entry(&self, url: &str) -> Result<Option<FileEntry>, StoreError> {
        let entry = self
            .conn
            .prepare_cached(&format!("{} WHERE url = ?1", SELECT_COLUMNS))?
            .query_row([url], row_to_entry)
            .optional()?;
        Ok(entry)
    }

    /// Look up an entry by id.
    pub fn get_file_entry_by_id(&self, id: RowId) -> Result<Option<FileEntry>, StoreError> {
        if !id.is_valid() {
            return Ok(None);
        }
        let entry = self
            .conn
            .prepare_cached(&format!("{} WHERE fileid = ?1", SELECT_COLUMNS))?
            .query_row([id.get()], row_to_entry)
            .optional()?;
        Ok(entry)
    }

    /// Persist an entry, replacing any previous entry for the same URL.
    ///
    /// # Returns
    ///
    /// The entry tagged with its row id.
    pub fn store_file_entry(&mut self, entry: &FileEntry) -> Result<FileEntry, StoreError> {
        let size = entry.size();
        let conn = &self.conn;
        let id: i64 = retry_busy(|| {
            conn.query_row(
                "INSERT INTO files (url, size, mtime, format, width, height)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (url) DO UPDATE SET
                     size = excluded.size,
                     mtime = excluded.mtime,
                     format = excluded.format,
                     width = excluded.width,
                     height = excluded.height
                 RETURNING fileid",
                params![
                    entry.url(),
                    entry.byte_size() as i64,
                    entry.mtime(),
                    entry.format().as_i64(),
                    size.width,
                    size.height,
                ],
                |row| row.get(0),
            )
        })?;

        debug!(url = entry.url(), id = id, "Stored file entry");
        Ok(entry.clone().with_id(RowId::new(id)))
    }

    /// Every entry, ordered by URL.
    pub fn get_file_entries(&self) -> Result<Vec<FileEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{} ORDER BY url", SELECT_COLUMNS))?;
        let rows = stmt.query_map([], row_to_entry)?;
        collect_rows(rows)
    }

    /// Entries whose URL matches a glob pattern (`*`, `?`, `[...]`).
    pub fn get_file_entries_by_pattern(&self, pattern: &str) -> Result<Vec<FileEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{} WHERE url GLOB ?1 ORDER BY url", SELECT_COLUMNS))?;
        let rows = stmt.query_map([pattern], row_to_entry)?;
        collect_rows(rows)
    }

    /// Remove an entry. Missing ids are ignored.
    pub fn delete_file_entry(&mut self, id: RowId) -> Result<(), StoreError> {
        if !id.is_valid() {
            return Ok(());
        }
        let conn = &self.conn;
        retry_busy(|| conn.execute("DELETE FROM files WHERE fileid = ?1", [id.get()]))?;
        Ok(())
    }

    /// Reclaim unused space.
    pub fn vacuum(&self) -> Result<(), StoreError> {
        vacuum(&self.conn)
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<FileEntry> {
    let id: i64 = row.get(0)?;
    let url: String = row.get(1)?;
    let byte_size: i64 = row.get(2)?;
    let mtime: i64 = row.get(3)?;
    let format: i64 = row.get(4)?;
    let width: u32 = row.get(5)?;
    let height: u32 = row.get(6)?;

    Ok(FileEntry::new(
        url,
        byte_size.max(0) as u64,
        mtime,
        Size::new(width, height),
        TileFormat::from_i64(format),
    )
    .with_id(RowId::new(id)))
}

fn collect_rows(
    rows: impl Iterator<Item = rusqlite::Result<FileEntry>>,
) -> Result<Vec<FileEntry>, StoreError> {
    let mut entries = Vec::new();
    for entry in rows {
        entries.push(entry?);
    }
    Ok(entries)
}
