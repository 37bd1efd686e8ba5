//! SQLite-backed tile store and shared connection helpers.

use std::path::Path;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, warn};

use super::{encode_entry, RowId, TileStore};
use crate::error::StoreError;
use crate::tile::{TileEncoder, TileEntry, TileFormat, TileKey, TilePos};

/// How long SQLite itself waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Retries on top of the busy timeout.
const MAX_BUSY_RETRIES: u32 = 5;

const INITIAL_BACKOFF: Duration = Duration::from_millis(20);

const TILES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tiles (
        image_id INTEGER,
        scale    INTEGER,
        x        INTEGER,
        y        INTEGER,
        data     BLOB,
        format   INTEGER,
        UNIQUE (image_id, scale, x, y)
    );
";

// =============================================================================
// Connection Helpers
// =============================================================================

/// Open (creating if needed) a database file, or an in-memory database for `None`.
pub(crate) fn open_connection(path: Option<&Path>) -> Result<Connection, StoreError> {
    let conn = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)?
        }
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Run `op`, retrying with exponential backoff while the database is busy.
pub(crate) fn retry_busy<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if is_busy(&e) && attempt < MAX_BUSY_RETRIES => {
                attempt += 1;
                warn!(attempt = attempt, "Database busy, retrying in {:?}", backoff);
                thread::sleep(backoff);
                backoff *= 2;
            }
            result => return result,
        }
    }
}

/// Reclaim free pages.
pub(crate) fn vacuum(conn: &Connection) -> Result<(), StoreError> {
    retry_busy(|| conn.execute_batch("VACUUM"))?;
    Ok(())
}

// =============================================================================
// SQLite Tile Store
// =============================================================================

/// Tiles stored as BLOB rows in a `tiles` table.
pub struct SqliteTileStore {
    conn: Connection,
    encoder: TileEncoder,
}

impl SqliteTileStore {
    /// Open the store at `path`, creating the file and schema if needed.
    pub fn open(path: &Path, encoder: TileEncoder) -> Result<Self, StoreError> {
        debug!(path = %path.display(), "Opening SQLite tile store");
        Self::with_connection(open_connection(Some(path))?, encoder)
    }

    /// A private in-memory store.
    pub fn open_in_memory(encoder: TileEncoder) -> Result<Self, StoreError> {
        Self::with_connection(open_connection(None)?, encoder)
    }

    fn with_connection(conn: Connection, encoder: TileEncoder) -> Result<Self, StoreError> {
        conn.execute_batch(TILES_SCHEMA)?;
        Ok(Self { conn, encoder })
    }

    /// Number of rows stored for an image.
    pub fn tile_count(&self, image_id: RowId) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tiles WHERE image_id = ?1",
            [image_id.get()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn insert_rows(conn: &mut Connection, rows: &[(TileKey, Bytes, TileFormat)]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO tiles (image_id, scale, x, y, data, format)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (image_id, scale, x, y)
             DO UPDATE SET data = excluded.data, format = excluded.format",
        )?;
        for (key, data, format) in rows {
            stmt.execute(params![
                key.image_id.get(),
                key.scale,
                key.pos.x,
                key.pos.y,
                data.as_ref(),
                format.as_i64(),
            ])?;
        }
    }
    tx.commit()
}

impl TileStore for SqliteTileStore {
    fn has_tile(&self, image_id: RowId, pos: TilePos, scale: u32) -> Result<bool, StoreError> {
        if !image_id.is_valid() {
            return Ok(false);
        }
        let found = self
            .conn
            .prepare_cached("SELECT 1 FROM tiles WHERE image_id = ?1 AND scale = ?2 AND x = ?3 AND y = ?4")?
            .query_row(params![image_id.get(), scale, pos.x, pos.y], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn get_tile(&self, image_id: RowId, scale: u32, pos: TilePos) -> Result<Option<TileEntry>, StoreError> {
        if !image_id.is_valid() {
            return Ok(None);
        }
        let row = self
            .conn
            .prepare_cached(
                "SELECT data, format FROM tiles WHERE image_id = ?1 AND scale = ?2 AND x = ?3 AND y = ?4",
            )?
            .query_row(params![image_id.get(), scale, pos.x, pos.y], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;

        Ok(row.map(|(data, format)| {
            TileEntry::from_blob(
                TileKey::new(image_id, scale, pos),
                Bytes::from(data),
                TileFormat::from_i64(format),
            )
        }))
    }

    fn get_tiles(&self, image_id: RowId) -> Result<Vec<TileEntry>, StoreError> {
        if !image_id.is_valid() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare_cached(
            "SELECT scale, x, y, data, format FROM tiles WHERE image_id = ?1 ORDER BY scale, y, x",
        )?;
        let rows = stmt.query_map([image_id.get()], |row| {
            let key = TileKey::new(image_id, row.get(0)?, TilePos::new(row.get(1)?, row.get(2)?));
            let data: Vec<u8> = row.get(3)?;
            let format: i64 = row.get(4)?;
            Ok(TileEntry::from_blob(key, Bytes::from(data), TileFormat::from_i64(format)))
        })?;

        let mut tiles = Vec::new();
        for tile in rows {
            tiles.push(tile?);
        }
        Ok(tiles)
    }

    fn get_min_max_scale(&self, image_id: RowId) -> Result<Option<(u32, u32)>, StoreError> {
        if !image_id.is_valid() {
            return Ok(None);
        }
        let (min, max): (Option<u32>, Option<u32>) = self
            .conn
            .prepare_cached("SELECT MIN(scale), MAX(scale) FROM tiles WHERE image_id = ?1")?
            .query_row([image_id.get()], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(min.zip(max))
    }

    fn store_tiles(&mut self, tiles: &[TileEntry]) -> Result<(), StoreError> {
        let rows = tiles
            .iter()
            .filter(|t| t.image_id().is_valid())
            .map(|t| encode_entry(&self.encoder, t).map(|(data, format)| (t.key(), data, format)))
            .collect::<Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Ok(());
        }

        retry_busy(|| insert_rows(&mut self.conn, &rows))?;
        debug!(count = rows.len(), "Stored tiles in SQLite");
        Ok(())
    }

    fn delete_tiles(&mut self, image_id: RowId) -> Result<(), StoreError> {
        if !image_id.is_valid() {
            return Ok(());
        }
        let conn = &self.conn;
        retry_busy(|| conn.execute("DELETE FROM tiles WHERE image_id = ?1", [image_id.get()]))?;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), StoreError> {
        vacuum(&self.conn)
    }
}
