use chrono::{DateTime, NaiveDate, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Single-band raster data (row-major, height x width)
pub type BandImage = Array2<f32>;

/// Per-pixel land-cover class ids, same extent as the source raster
pub type ClassMask = Array2<u8>;

/// Land-cover / urban classes produced by both classifier strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LandCoverClass {
    Background,
    Urban,
    Vegetation,
    Water,
    BareSoil,
    Road,
}

impl LandCoverClass {
    /// Stable small-integer id used in class masks
    pub fn id(self) -> u8 {
        match self {
            LandCoverClass::Background => 0,
            LandCoverClass::Urban => 1,
            LandCoverClass::Vegetation => 2,
            LandCoverClass::Water => 3,
            LandCoverClass::BareSoil => 4,
            LandCoverClass::Road => 5,
        }
    }

    /// Inverse of [`LandCoverClass::id`]; unknown ids map to `Background`
    pub fn from_id(id: u8) -> Self {
        match id {
            1 => LandCoverClass::Urban,
            2 => LandCoverClass::Vegetation,
            3 => LandCoverClass::Water,
            4 => LandCoverClass::BareSoil,
            5 => LandCoverClass::Road,
            _ => LandCoverClass::Background,
        }
    }
}

impl std::fmt::Display for LandCoverClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LandCoverClass::Background => write!(f, "background"),
            LandCoverClass::Urban => write!(f, "urban_built"),
            LandCoverClass::Vegetation => write!(f, "vegetation"),
            LandCoverClass::Water => write!(f, "water"),
            LandCoverClass::BareSoil => write!(f, "bare_soil"),
            LandCoverClass::Road => write!(f, "road"),
        }
    }
}

/// Geographic bounding box in degrees.
///
/// Validated on construction and immutable afterwards; the canonical
/// 6-decimal formatting of the corners doubles as the cache key input.
/// Serializes for diagnostics only; construction always goes through
/// [`BoundingBox::new`] so the invariants cannot be bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

impl BoundingBox {
    /// Construct a bounding box, rejecting degenerate or out-of-range corners
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> TerraResult<Self> {
        if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
            return Err(TerraError::InvalidBoundingBox(format!(
                "longitude out of range: west={}, east={}",
                west, east
            )));
        }
        if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
            return Err(TerraError::InvalidBoundingBox(format!(
                "latitude out of range: south={}, north={}",
                south, north
            )));
        }
        if north <= south {
            return Err(TerraError::InvalidBoundingBox(format!(
                "north ({}) must be greater than south ({})",
                north, south
            )));
        }
        if east <= west {
            return Err(TerraError::InvalidBoundingBox(format!(
                "east ({}) must be greater than west ({})",
                east, west
            )));
        }
        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }

    pub fn west(&self) -> f64 {
        self.west
    }

    pub fn south(&self) -> f64 {
        self.south
    }

    pub fn east(&self) -> f64 {
        self.east
    }

    pub fn north(&self) -> f64 {
        self.north
    }

    /// Canonical key string for cache hashing: corners rounded to six
    /// decimal digits (about 0.1 m at the equator), joined with the date.
    pub fn key_string(&self, date: NaiveDate) -> String {
        format!(
            "{:.6}_{:.6}_{:.6}_{:.6}_{}",
            self.west,
            self.south,
            self.east,
            self.north,
            date.format("%Y-%m-%d")
        )
    }

    /// WMS-ordered corner string (south,west,north,east)
    pub fn wms_string(&self) -> String {
        format!("{},{},{},{}", self.south, self.west, self.north, self.east)
    }

    /// Partition into an `n` x `n` grid of equal sub-boxes
    pub fn grid(&self, n: u32) -> Vec<GridCell> {
        let lat_step = (self.north - self.south) / n as f64;
        let lon_step = (self.east - self.west) / n as f64;

        let mut cells = Vec::with_capacity((n * n) as usize);
        for row in 0..n {
            for col in 0..n {
                let cell = BoundingBox {
                    west: self.west + col as f64 * lon_step,
                    south: self.south + row as f64 * lat_step,
                    east: self.west + (col + 1) as f64 * lon_step,
                    north: self.south + (row + 1) as f64 * lat_step,
                };
                cells.push(GridCell {
                    row,
                    col,
                    bbox: cell,
                });
            }
        }
        cells
    }
}

/// One rectangular sub-partition of an analyzed region
#[derive(Debug, Clone, Copy)]
pub struct GridCell {
    pub row: u32,
    pub col: u32,
    pub bbox: BoundingBox,
}

/// Additive change statistics for one change category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeStats {
    pub pixels: u64,
    pub area_sqm: f64,
    pub area_hectares: f64,
    pub area_acres: f64,
    pub area_sqkm: f64,
}

impl ChangeStats {
    /// Build statistics from a pixel count at the given resolution (m/pixel)
    pub fn from_pixels(pixels: u64, resolution_m: f64) -> Self {
        let area_sqm = pixels as f64 * resolution_m * resolution_m;
        let area_hectares = area_sqm * 1e-4;
        Self {
            pixels,
            area_sqm,
            area_hectares,
            area_acres: area_hectares * 2.47105,
            area_sqkm: area_sqm * 1e-6,
        }
    }

    /// Accumulate another cell's statistics into this one
    pub fn merge(&mut self, other: &ChangeStats) {
        self.pixels += other.pixels;
        self.area_sqm += other.area_sqm;
        self.area_hectares += other.area_hectares;
        self.area_acres += other.area_acres;
        self.area_sqkm += other.area_sqkm;
    }
}

/// Severity tiers for a change percentage.
///
/// Thresholds are strictly greater-than: exactly 10.0 stays `Medium`
/// and exactly 5.0 stays `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_change_percentage(pct: f64) -> Self {
        if pct > 10.0 {
            Severity::High
        } else if pct > 5.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
        }
    }
}

/// Confidence tier for the raw-diff change-type heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Low => write!(f, "Low"),
            Confidence::Medium => write!(f, "Medium"),
        }
    }
}

/// Why the fetcher substituted a synthetic tile for real imagery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// No credentials configured for the imagery source
    MissingCredentials,
    /// Token endpoint refused or was unreachable after retries
    TokenUnavailable,
    /// Tile request failed after retries
    RequestFailed(String),
    /// Endpoint answered with something that is not an image
    NonImageResponse(String),
    /// Decoded image had near-zero variance (no data for this date)
    BlankResponse,
}

/// How a tile was obtained.
///
/// The availability-first acquisition contract: every `get_tile` call
/// resolves to a usable raster, and this tag records which path produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    /// Returned from the cache without network access
    CacheHit,
    /// Fetched from the imagery source and cached
    Fetched,
    /// Generated synthetically after an acquisition failure
    SyntheticFallback(FallbackReason),
}

/// A tile on disk plus the acquisition path that produced it
#[derive(Debug, Clone)]
pub struct AcquiredTile {
    pub path: PathBuf,
    pub outcome: AcquisitionOutcome,
}

impl AcquiredTile {
    pub fn is_synthetic(&self) -> bool {
        matches!(self.outcome, AcquisitionOutcome::SyntheticFallback(_))
    }
}

/// OAuth access token held in memory only; `expires_at` already carries
/// the safety margin applied when the token was stored
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Error types for change-detection processing
#[derive(Debug, thiserror::Error)]
pub enum TerraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    #[error("cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("analysis rejected: {0}")]
    RejectedInput(String),

    #[error("processing error: {0}")]
    Processing(String),
}

/// Result type for change-detection operations
pub type TerraResult<T> = Result<T, TerraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_id_roundtrip() {
        for class in [
            LandCoverClass::Background,
            LandCoverClass::Urban,
            LandCoverClass::Vegetation,
            LandCoverClass::Water,
            LandCoverClass::BareSoil,
            LandCoverClass::Road,
        ] {
            assert_eq!(LandCoverClass::from_id(class.id()), class);
        }
        assert_eq!(LandCoverClass::from_id(200), LandCoverClass::Background);
    }

    #[test]
    fn test_grid_partition_covers_parent() {
        let bbox = BoundingBox::new(77.37, 12.734, 77.88, 13.173).unwrap();
        let cells = bbox.grid(4);
        assert_eq!(cells.len(), 16);

        let first = &cells[0];
        assert_eq!((first.row, first.col), (0, 0));
        assert!((first.bbox.west() - bbox.west()).abs() < 1e-12);
        assert!((first.bbox.south() - bbox.south()).abs() < 1e-12);

        let last = &cells[15];
        assert_eq!((last.row, last.col), (3, 3));
        assert!((last.bbox.east() - bbox.east()).abs() < 1e-9);
        assert!((last.bbox.north() - bbox.north()).abs() < 1e-9);
    }

    #[test]
    fn test_change_stats_from_pixels() {
        let stats = ChangeStats::from_pixels(100, 10.0);
        assert_eq!(stats.pixels, 100);
        assert!((stats.area_sqm - 10_000.0).abs() < 1e-9);
        assert!((stats.area_hectares - 1.0).abs() < 1e-9);
        assert!((stats.area_acres - 2.47105).abs() < 1e-9);
        assert!((stats.area_sqkm - 0.01).abs() < 1e-9);
    }
}
