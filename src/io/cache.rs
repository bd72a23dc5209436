use crate::types::{BoundingBox, TerraError, TerraResult};
use chrono::{DateTime, NaiveDate, Utc};
use image::RgbImage;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Persistent tile cache: one SQLite row plus one PNG file per (bbox, date).
///
/// The store exclusively owns entry lifecycle; callers only ever read the
/// returned paths. Writes go through `INSERT OR REPLACE`, so concurrent
/// writers for the same key resolve last-writer-wins, which is acceptable
/// because tile content for a given bbox+date is fungible.
pub struct TileCacheStore {
    conn: Connection,
    cache_dir: PathBuf,
    expire_days: i64,
}

/// Diagnostic view of one cache row
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bbox_hash: String,
    pub date: String,
    pub image_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TileCacheStore {
    /// Open (or create) the cache under the given directory
    pub fn open(cache_dir: impl AsRef<Path>, expire_days: i64) -> TerraResult<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&cache_dir)?;

        let conn = Connection::open(cache_dir.join("tiles.db"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cached_tiles (
                bbox_hash  TEXT PRIMARY KEY,
                date       TEXT NOT NULL,
                image_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                bbox_west  REAL,
                bbox_south REAL,
                bbox_east  REAL,
                bbox_north REAL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tiles_expires ON cached_tiles(expires_at)",
            [],
        )?;

        Ok(Self {
            conn,
            cache_dir,
            expire_days,
        })
    }

    /// Content-addressed key: sha256 over the canonical bbox+date string
    pub fn tile_key(bbox: &BoundingBox, date: NaiveDate) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bbox.key_string(date).as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Return a still-valid cached tile path, if any.
    ///
    /// A stale timestamp or a missing backing file both count as absence,
    /// even when the database row exists.
    pub fn lookup(&self, bbox: &BoundingBox, date: NaiveDate) -> TerraResult<Option<PathBuf>> {
        let key = Self::tile_key(bbox, date);
        let date_str = format!("{}", date.format("%Y-%m-%d"));

        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT image_path, expires_at FROM cached_tiles
                 WHERE bbox_hash = ?1 AND date = ?2",
                params![key, date_str],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (image_path, expires_at) = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let expires_at = parse_timestamp(&expires_at)?;
        if expires_at <= Utc::now() {
            log::debug!("cache entry for {} expired at {}", key, expires_at);
            return Ok(None);
        }

        let path = PathBuf::from(image_path);
        if !path.exists() {
            log::warn!("cache row {} has no backing file at {}", key, path.display());
            return Ok(None);
        }

        Ok(Some(path))
    }

    /// Persist a fetched tile and record it with a fresh expiration.
    ///
    /// Only successful fetches reach this point; failures are never cached.
    pub fn store(
        &self,
        bbox: &BoundingBox,
        date: NaiveDate,
        image: &RgbImage,
    ) -> TerraResult<PathBuf> {
        let key = Self::tile_key(bbox, date);
        let date_str = format!("{}", date.format("%Y-%m-%d"));
        let path = self.cache_dir.join(format!("{}.png", key));
        let path_str = path.to_string_lossy().into_owned();

        image
            .save(&path)
            .map_err(|e| TerraError::Processing(format!("failed to write cached tile: {}", e)))?;

        let now = Utc::now();
        let expires_at = now + chrono::Duration::days(self.expire_days);

        self.conn.execute(
            "INSERT OR REPLACE INTO cached_tiles
             (bbox_hash, date, image_path, created_at, expires_at,
              bbox_west, bbox_south, bbox_east, bbox_north)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                key,
                date_str,
                path_str,
                now.to_rfc3339(),
                expires_at.to_rfc3339(),
                bbox.west(),
                bbox.south(),
                bbox.east(),
                bbox.north(),
            ],
        )?;

        log::info!("cached tile {} for {}", key, date_str);
        Ok(path)
    }

    /// Remove every expired row and its backing file; returns the count.
    ///
    /// Maintenance only, never called on the tile hot path.
    pub fn evict_expired(&self) -> TerraResult<usize> {
        let now = Utc::now().to_rfc3339();

        let mut stmt = self
            .conn
            .prepare("SELECT bbox_hash, image_path FROM cached_tiles WHERE expires_at <= ?1")?;
        let expired: Vec<(String, String)> = stmt
            .query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for (key, image_path) in &expired {
            let path = Path::new(image_path);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    log::warn!("failed to remove cached file for {}: {}", key, e);
                }
            }
        }

        self.conn
            .execute("DELETE FROM cached_tiles WHERE expires_at <= ?1", params![now])?;

        log::info!("evicted {} expired cache entries", expired.len());
        Ok(expired.len())
    }

    /// All rows currently in the store, for diagnostics
    pub fn entries(&self) -> TerraResult<Vec<CacheEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT bbox_hash, date, image_path, created_at, expires_at FROM cached_tiles",
        )?;
        let rows: Vec<(String, String, String, String, String)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (bbox_hash, date, image_path, created_at, expires_at) in rows {
            entries.push(CacheEntry {
                bbox_hash,
                date,
                image_path: PathBuf::from(image_path),
                created_at: parse_timestamp(&created_at)?,
                expires_at: parse_timestamp(&expires_at)?,
            });
        }
        Ok(entries)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

fn parse_timestamp(value: &str) -> TerraResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TerraError::Processing(format!("malformed cache timestamp {:?}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn test_bbox() -> BoundingBox {
        BoundingBox::new(77.37, 12.734, 77.88, 13.173).unwrap()
    }

    fn test_image() -> RgbImage {
        RgbImage::from_fn(8, 8, |x, y| Rgb([x as u8 * 16, y as u8 * 16, 64]))
    }

    #[test]
    fn test_key_is_deterministic_and_date_sensitive() {
        let bbox = test_bbox();
        let d1 = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();

        assert_eq!(
            TileCacheStore::tile_key(&bbox, d1),
            TileCacheStore::tile_key(&bbox, d1)
        );
        assert_ne!(
            TileCacheStore::tile_key(&bbox, d1),
            TileCacheStore::tile_key(&bbox, d2)
        );
    }

    #[test]
    fn test_store_then_lookup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileCacheStore::open(dir.path(), 30).unwrap();
        let bbox = test_bbox();
        let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();

        assert!(store.lookup(&bbox, date).unwrap().is_none());

        let stored = store.store(&bbox, date, &test_image()).unwrap();
        let found = store.lookup(&bbox, date).unwrap().expect("cache hit");
        assert_eq!(stored, found);
        assert!(found.exists());
    }

    #[test]
    fn test_missing_backing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileCacheStore::open(dir.path(), 30).unwrap();
        let bbox = test_bbox();
        let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();

        let path = store.store(&bbox, date, &test_image()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(store.lookup(&bbox, date).unwrap().is_none());
    }

    #[test]
    fn test_expired_entry_is_absent_and_evictable() {
        let dir = tempfile::tempdir().unwrap();
        // Zero-day lifetime: the entry is expired the moment it lands.
        let store = TileCacheStore::open(dir.path(), 0).unwrap();
        let bbox = test_bbox();
        let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();

        let path = store.store(&bbox, date, &test_image()).unwrap();
        assert!(store.lookup(&bbox, date).unwrap().is_none());

        let evicted = store.evict_expired().unwrap();
        assert_eq!(evicted, 1);
        assert!(!path.exists());
        assert!(store.entries().unwrap().is_empty());
    }
}
