//! Streaming grid pipeline: partition a region, drive acquisition,
//! classification and change detection per cell, and merge the results
//! into one additive summary plus a mosaic visualization.
//!
//! Raw imagery never outlives its own cell: each tile is classified and
//! dropped before the next fetch, bounding peak memory for arbitrarily
//! large regions.

use crate::config::Config;
use crate::core::change::{default_change_categories, ChangeCategory, ChangeDetector};
use crate::core::classify::LandCoverClassifier;
use crate::io::{TileCacheStore, TileFetcher};
use crate::types::{BoundingBox, ChangeStats, GridCell, TerraResult};
use chrono::NaiveDate;
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Aggregate result of one region analysis run
#[derive(Debug, Clone, Serialize)]
pub struct RegionSummary {
    /// Additive per-category totals, keyed by category key
    pub categories: BTreeMap<String, ChangeStats>,
    pub tiles_processed: u32,
    pub tiles_failed: u32,
    /// How many processed tiles used synthetic fallback imagery
    pub synthetic_tiles: u32,
    pub mosaic_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
}

/// Grid aggregator owning the acquisition and analysis services.
///
/// Service lifetime follows the load-once-reuse-many-times intent:
/// construct one analyzer per process or per run orchestrator and pass
/// it wherever analyses are triggered.
pub struct RegionAnalyzer {
    fetcher: TileFetcher,
    cache: TileCacheStore,
    classifier: Box<dyn LandCoverClassifier + Send>,
    detector: ChangeDetector,
    categories: Vec<ChangeCategory>,
    tile_size: (u32, u32),
    output_dir: PathBuf,
}

impl RegionAnalyzer {
    pub fn new(
        config: Config,
        classifier: Box<dyn LandCoverClassifier + Send>,
        output_dir: impl AsRef<Path>,
    ) -> TerraResult<Self> {
        let cache = TileCacheStore::open(&config.cache_dir, config.cache_expire_days)?;
        let detector = ChangeDetector::new(config.resolution_m);
        let tile_size = (config.tile_size, config.tile_size);
        let fetcher = TileFetcher::new(config)?;

        Ok(Self {
            fetcher,
            cache,
            classifier,
            detector,
            categories: default_change_categories(),
            tile_size,
            output_dir: output_dir.as_ref().to_path_buf(),
        })
    }

    /// Replace the default change category set
    pub fn with_categories(mut self, categories: Vec<ChangeCategory>) -> Self {
        self.categories = categories;
        self
    }

    pub fn categories(&self) -> &[ChangeCategory] {
        &self.categories
    }

    /// Analyze a region between two dates over a `grid_n` x `grid_n` grid
    pub fn analyze_region(
        &self,
        bbox: &BoundingBox,
        before_date: NaiveDate,
        after_date: NaiveDate,
        grid_n: u32,
    ) -> TerraResult<RegionSummary> {
        self.analyze_region_with_progress(bbox, before_date, after_date, grid_n, |_, _| {})
    }

    /// Same as [`RegionAnalyzer::analyze_region`], reporting
    /// `(cells_done, cells_total)` after each cell so a run registry can
    /// track progress.
    pub fn analyze_region_with_progress(
        &self,
        bbox: &BoundingBox,
        before_date: NaiveDate,
        after_date: NaiveDate,
        grid_n: u32,
        mut on_progress: impl FnMut(u32, u32),
    ) -> TerraResult<RegionSummary> {
        let cells = bbox.grid(grid_n);
        let total = cells.len() as u32;
        log::info!(
            "analyzing region {} to {} over {}x{} = {} cells",
            before_date,
            after_date,
            grid_n,
            grid_n,
            total
        );

        std::fs::create_dir_all(&self.output_dir)?;

        let mut totals: BTreeMap<String, ChangeStats> = self
            .categories
            .iter()
            .map(|c| (c.key.clone(), ChangeStats::default()))
            .collect();
        let mut viz_tiles: Vec<(u32, u32, RgbImage)> = Vec::new();
        let mut tiles_processed = 0u32;
        let mut tiles_failed = 0u32;
        let mut synthetic_tiles = 0u32;

        for (done, cell) in cells.iter().enumerate() {
            match self.process_cell(cell, before_date, after_date) {
                Ok(outcome) => {
                    for (key, stats) in &outcome.stats {
                        if let Some(total) = totals.get_mut(key) {
                            total.merge(stats);
                        }
                    }
                    if outcome.used_synthetic {
                        synthetic_tiles += 1;
                    }
                    viz_tiles.push((cell.row, cell.col, outcome.visualization));
                    tiles_processed += 1;
                }
                Err(e) => {
                    // A failed cell contributes nothing and leaves a hole
                    // in the mosaic; the run itself continues.
                    log::warn!(
                        "failed to process cell ({}, {}): {}",
                        cell.row,
                        cell.col,
                        e
                    );
                    tiles_failed += 1;
                }
            }
            on_progress(done as u32 + 1, total);
        }

        let mosaic_path = self.save_mosaic(&viz_tiles, grid_n)?;

        let mut summary = RegionSummary {
            categories: totals,
            tiles_processed,
            tiles_failed,
            synthetic_tiles,
            mosaic_path,
            summary_path: None,
        };

        let summary_path = self.output_dir.join("changes_summary.json");
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| crate::types::TerraError::Processing(format!("summary encoding: {}", e)))?;
        std::fs::write(&summary_path, json)?;
        summary.summary_path = Some(summary_path);

        log::info!(
            "analysis complete: {} cells processed, {} failed",
            tiles_processed,
            tiles_failed
        );
        Ok(summary)
    }

    fn process_cell(
        &self,
        cell: &GridCell,
        before_date: NaiveDate,
        after_date: NaiveDate,
    ) -> TerraResult<CellOutcome> {
        let before_tile =
            self.fetcher
                .get_tile(&self.cache, &cell.bbox, before_date, self.tile_size)?;
        let before_image = image::open(&before_tile.path)?.to_rgb8();
        let before_mask = self.classifier.classify(&before_image)?;
        drop(before_image);

        let after_tile = self
            .fetcher
            .get_tile(&self.cache, &cell.bbox, after_date, self.tile_size)?;
        let after_image = image::open(&after_tile.path)?.to_rgb8();
        let after_mask = self.classifier.classify(&after_image)?;
        drop(after_image);

        let report =
            self.detector
                .detect_class_changes(&before_mask, &after_mask, &self.categories)?;

        Ok(CellOutcome {
            stats: report.stats,
            visualization: report.visualization,
            used_synthetic: before_tile.is_synthetic() || after_tile.is_synthetic(),
        })
    }

    fn save_mosaic(
        &self,
        tiles: &[(u32, u32, RgbImage)],
        grid_n: u32,
    ) -> TerraResult<Option<PathBuf>> {
        let (tile_w, tile_h) = match tiles.first() {
            Some((_, _, tile)) => tile.dimensions(),
            None => return Ok(None),
        };

        let mut mosaic = RgbImage::new(grid_n * tile_w, grid_n * tile_h);
        for (row, col, tile) in tiles {
            image::imageops::replace(
                &mut mosaic,
                tile,
                (*col * tile_w) as i64,
                (*row * tile_h) as i64,
            );
        }

        let path = self.output_dir.join("change_map.png");
        mosaic
            .save(&path)
            .map_err(|e| crate::types::TerraError::Processing(format!("mosaic write: {}", e)))?;
        log::info!("saved change map mosaic to {}", path.display());
        Ok(Some(path))
    }
}

struct CellOutcome {
    stats: BTreeMap<String, ChangeStats>,
    visualization: RgbImage,
    used_synthetic: bool,
}
