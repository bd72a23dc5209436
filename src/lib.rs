//! TerraWatch: A Resilient Satellite Land-Cover Change Detection Engine
//!
//! This library estimates land-cover change between two satellite
//! acquisitions of the same region: it obtains a raster per requested
//! date (cache-first, with a deterministic synthetic fallback when real
//! imagery cannot be fetched), classifies pixels into land-cover classes
//! via spectral heuristics or a pluggable segmentation backend, and
//! compares the classifications to quantify and visualize change over a
//! spatial grid.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::Config;
pub use types::{
    AccessToken, AcquiredTile, AcquisitionOutcome, BandImage, BoundingBox, ChangeStats, ClassMask,
    Confidence, FallbackReason, GridCell, LandCoverClass, Severity, TerraError, TerraResult,
};

pub use crate::core::{
    ChangeCategory, ChangeDetector, LandCoverClassifier, RegionAnalyzer, RegionSummary,
    RunRegistry, RunState, SpectralClassifier,
};

pub use io::{TileCacheStore, TileFetcher};
