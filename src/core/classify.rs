//! Land-cover classification strategies.
//!
//! Two interchangeable strategies honor the same `classify` contract: a
//! multi-method spectral/textural heuristic for false-color composites,
//! and a pretrained segmentation backend remapped onto the system's
//! six-class vocabulary through an explicit, versioned lookup table.

use crate::core::filters::{self, BoolMask};
use crate::types::{BandImage, ChangeStats, ClassMask, LandCoverClass, TerraError, TerraResult};
use image::{Rgb, RgbImage};
use ndarray::Array2;
use std::collections::HashMap;

/// Common contract for both classification strategies
pub trait LandCoverClassifier {
    fn classify(&self, image: &RgbImage) -> TerraResult<ClassMask>;
}

/// Normalized difference of the NIR and red bands
pub fn ndvi(nir: &BandImage, red: &BandImage) -> BandImage {
    let mut out = Array2::zeros(nir.dim());
    for ((i, j), value) in out.indexed_iter_mut() {
        let n = nir[[i, j]];
        let r = red[[i, j]];
        *value = (n - r) / (n + r + 1e-8);
    }
    out
}

/// Fraction of set pixels in a boolean mask, as a percentage
pub fn mask_percentage(mask: &BoolMask) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    let set = mask.iter().filter(|&&v| v).count();
    set as f64 / mask.len() as f64 * 100.0
}

/// Fraction of mask pixels holding the given class, as a percentage
pub fn class_percentage(mask: &ClassMask, class: LandCoverClass) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    let id = class.id();
    let count = mask.iter().filter(|&&v| v == id).count();
    count as f64 / mask.len() as f64 * 100.0
}

/// Thresholds for the spectral/textural voting scheme.
///
/// Defaults are tuned for Sentinel-2 false-color composites where the
/// displayed channels carry NIR, red and green.
#[derive(Debug, Clone)]
pub struct SpectralParams {
    /// Lower NDVI bound for urban candidates (below is water)
    pub ndvi_lower: f32,
    /// Upper NDVI bound for urban candidates (above is vegetation)
    pub ndvi_upper: f32,
    /// Image-adaptive NIR percentile; urban candidates fall below it
    pub nir_percentile: f64,
    /// Grayscale band-pass excluding water/shadow and saturated cover
    pub brightness_min: f32,
    pub brightness_max: f32,
    /// Gradient magnitude above which a pixel counts as an edge
    pub edge_threshold: f32,
    /// Structuring element for the cleanup close/open passes
    pub cleanup_kernel: usize,
}

impl Default for SpectralParams {
    fn default() -> Self {
        Self {
            ndvi_lower: -0.3,
            ndvi_upper: 0.25,
            nir_percentile: 40.0,
            brightness_min: 30.0,
            brightness_max: 150.0,
            edge_threshold: 100.0,
            cleanup_kernel: 3,
        }
    }
}

/// Multi-method spectral/textural heuristic classifier for false-color
/// near-infrared composites
#[derive(Debug, Clone, Default)]
pub struct SpectralClassifier {
    params: SpectralParams,
}

impl SpectralClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: SpectralParams) -> Self {
        Self { params }
    }

    /// Urban detection mask plus urban percentage.
    ///
    /// Four independent signals vote per pixel:
    /// NDVI band-pass, adaptive NIR threshold, brightness band-pass and
    /// edge-density texture. Core urban = the first three; texture widens
    /// the NIR+brightness agreement. One morphological close then open
    /// removes speckle and fills pinholes.
    pub fn urban_mask(&self, image: &RgbImage) -> TerraResult<(BoolMask, f64)> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(TerraError::RejectedInput("empty image".to_string()));
        }

        let nir = filters::channel(image, 0);
        let red = filters::channel(image, 1);
        let gray = filters::grayscale(image);
        let ndvi = ndvi(&nir, &red);

        let p = &self.params;

        let ndvi_candidate = ndvi.mapv(|v| v > p.ndvi_lower && v < p.ndvi_upper);

        let nir_threshold = filters::percentile(&nir, p.nir_percentile);
        let nir_candidate = nir.mapv(|v| v < nir_threshold);
        log::debug!("adaptive NIR threshold: {:.1}", nir_threshold);

        let brightness_candidate = gray.mapv(|v| v > p.brightness_min && v < p.brightness_max);

        let texture_candidate = filters::dilate(&filters::edge_mask(&gray, p.edge_threshold), 3);

        let dim = ndvi_candidate.dim();
        let mut voted = Array2::from_elem(dim, false);
        for ((i, j), value) in voted.indexed_iter_mut() {
            let core = ndvi_candidate[[i, j]]
                && nir_candidate[[i, j]]
                && brightness_candidate[[i, j]];
            let textured = nir_candidate[[i, j]]
                && brightness_candidate[[i, j]]
                && texture_candidate[[i, j]];
            *value = core || textured;
        }

        let cleaned = filters::open(&filters::close(&voted, p.cleanup_kernel), p.cleanup_kernel);
        let percentage = mask_percentage(&cleaned);
        log::info!("urban detection: {:.2}% of pixels", percentage);

        Ok((cleaned, percentage))
    }
}

impl LandCoverClassifier for SpectralClassifier {
    /// Full six-class mask from the same spectral signals: the voted mask
    /// becomes Urban, strong NDVI extremes become Vegetation and Water,
    /// remaining non-dark pixels become BareSoil. Road is only produced
    /// by the segmentation strategy.
    fn classify(&self, image: &RgbImage) -> TerraResult<ClassMask> {
        let (urban, _) = self.urban_mask(image)?;

        let nir = filters::channel(image, 0);
        let red = filters::channel(image, 1);
        let gray = filters::grayscale(image);
        let ndvi = ndvi(&nir, &red);
        let p = &self.params;

        let mut mask = Array2::zeros(urban.dim());
        for ((i, j), value) in mask.indexed_iter_mut() {
            let class = if urban[[i, j]] {
                LandCoverClass::Urban
            } else if ndvi[[i, j]] >= p.ndvi_upper {
                LandCoverClass::Vegetation
            } else if ndvi[[i, j]] <= p.ndvi_lower {
                LandCoverClass::Water
            } else if gray[[i, j]] > p.brightness_min {
                LandCoverClass::BareSoil
            } else {
                LandCoverClass::Background
            };
            *value = class.id();
        }

        Ok(mask)
    }
}

/// Before/after urban statistics derived from the spectral strategy
#[derive(Debug, Clone)]
pub struct UrbanChangeReport {
    pub before_percent: f64,
    pub after_percent: f64,
    pub change_percent: f64,
    /// Percent change relative to the before extent (0 when before is empty)
    pub growth_rate: f64,
    pub before_area: ChangeStats,
    pub after_area: ChangeStats,
    pub new_urban_pixels: u64,
    pub before_overlay: RgbImage,
    pub after_overlay: RgbImage,
    pub change_overlay: RgbImage,
}

impl SpectralClassifier {
    /// Compare urban extent between two acquisitions of the same region
    pub fn analyze_urban_change(
        &self,
        before: &RgbImage,
        after: &RgbImage,
        resolution_m: f64,
    ) -> TerraResult<UrbanChangeReport> {
        if before.dimensions() != after.dimensions() {
            return Err(TerraError::RejectedInput(format!(
                "raster extents differ: {:?} vs {:?}",
                before.dimensions(),
                after.dimensions()
            )));
        }

        let (before_mask, before_percent) = self.urban_mask(before)?;
        let (after_mask, after_percent) = self.urban_mask(after)?;

        let before_pixels = before_mask.iter().filter(|&&v| v).count() as u64;
        let after_pixels = after_mask.iter().filter(|&&v| v).count() as u64;

        let mut new_urban = Array2::from_elem(before_mask.dim(), false);
        for ((i, j), value) in new_urban.indexed_iter_mut() {
            *value = after_mask[[i, j]] && !before_mask[[i, j]];
        }
        let new_urban_pixels = new_urban.iter().filter(|&&v| v).count() as u64;

        let change_percent = after_percent - before_percent;
        let growth_rate = if before_percent > 0.0 {
            change_percent / before_percent * 100.0
        } else {
            0.0
        };

        Ok(UrbanChangeReport {
            before_percent,
            after_percent,
            change_percent,
            growth_rate,
            before_area: ChangeStats::from_pixels(before_pixels, resolution_m),
            after_area: ChangeStats::from_pixels(after_pixels, resolution_m),
            new_urban_pixels,
            before_overlay: class_overlay(before, &before_mask, Rgb([255, 0, 0]), 0.4),
            after_overlay: class_overlay(after, &after_mask, Rgb([255, 0, 0]), 0.4),
            change_overlay: class_overlay(after, &new_urban, Rgb([255, 165, 0]), 0.5),
        })
    }
}

/// Pretrained segmentation model producing its own native class ids
pub trait SegmentationBackend {
    fn segment(&self, image: &RgbImage) -> TerraResult<Array2<u16>>;
    fn name(&self) -> &str;
}

/// Versioned mapping from model-native class ids to the system vocabulary.
///
/// Unmapped ids fall through to the default class so a model upgrade can
/// never inject ids the rest of the pipeline does not understand.
#[derive(Debug, Clone)]
pub struct ClassRemapTable {
    version: u32,
    entries: HashMap<u16, LandCoverClass>,
    default_class: LandCoverClass,
}

impl ClassRemapTable {
    /// Default table for ADE20K-trained segmentation models
    /// (building, road, tree, water, generic vegetation, bare ground)
    pub fn ade20k_default() -> Self {
        let entries = HashMap::from([
            (3, LandCoverClass::Urban),
            (6, LandCoverClass::Road),
            (9, LandCoverClass::Vegetation),
            (11, LandCoverClass::Water),
            (13, LandCoverClass::Vegetation),
            (17, LandCoverClass::BareSoil),
        ]);
        Self {
            version: 1,
            entries,
            default_class: LandCoverClass::Background,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn remap(&self, model_class: u16) -> LandCoverClass {
        self.entries
            .get(&model_class)
            .copied()
            .unwrap_or(self.default_class)
    }

    /// Override or extend one mapping entry
    pub fn with_entry(mut self, model_class: u16, class: LandCoverClass) -> Self {
        self.entries.insert(model_class, class);
        self
    }
}

/// Model-backed classifier: segmentation backend plus remap table
pub struct SegmentationClassifier<B: SegmentationBackend> {
    backend: B,
    remap: ClassRemapTable,
}

impl<B: SegmentationBackend> SegmentationClassifier<B> {
    pub fn new(backend: B, remap: ClassRemapTable) -> Self {
        Self { backend, remap }
    }

    pub fn remap_table(&self) -> &ClassRemapTable {
        &self.remap
    }
}

impl<B: SegmentationBackend> LandCoverClassifier for SegmentationClassifier<B> {
    fn classify(&self, image: &RgbImage) -> TerraResult<ClassMask> {
        log::debug!("running segmentation backend {}", self.backend.name());
        let native = self.backend.segment(image)?;
        Ok(native.mapv(|id| self.remap.remap(id).id()))
    }
}

/// Composite a semi-transparent highlight over the masked pixels
pub fn class_overlay(image: &RgbImage, mask: &BoolMask, color: Rgb<u8>, alpha: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = image.clone();

    for y in 0..height {
        for x in 0..width {
            if mask[[y as usize, x as usize]] {
                let src = image.get_pixel(x, y).0;
                let mut blended = [0u8; 3];
                for c in 0..3 {
                    let v = src[c] as f32 * (1.0 - alpha) + color.0[c] as f32 * alpha;
                    blended[c] = v.clamp(0.0, 255.0) as u8;
                }
                out.put_pixel(x, y, Rgb(blended));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantBackend {
        class_id: u16,
    }

    impl SegmentationBackend for ConstantBackend {
        fn segment(&self, image: &RgbImage) -> TerraResult<Array2<u16>> {
            let (w, h) = image.dimensions();
            Ok(Array2::from_elem((h as usize, w as usize), self.class_id))
        }

        fn name(&self) -> &str {
            "constant"
        }
    }

    #[test]
    fn test_remap_table_defaults_unmapped_to_background() {
        let table = ClassRemapTable::ade20k_default();
        assert_eq!(table.remap(3), LandCoverClass::Urban);
        assert_eq!(table.remap(6), LandCoverClass::Road);
        assert_eq!(table.remap(11), LandCoverClass::Water);
        assert_eq!(table.remap(77), LandCoverClass::Background);
        assert_eq!(table.version(), 1);
    }

    #[test]
    fn test_segmentation_classifier_applies_remap() {
        let classifier = SegmentationClassifier::new(
            ConstantBackend { class_id: 9 },
            ClassRemapTable::ade20k_default(),
        );
        let image = RgbImage::from_pixel(4, 4, Rgb([120, 40, 40]));
        let mask = classifier.classify(&image).unwrap();
        assert!(mask.iter().all(|&v| v == LandCoverClass::Vegetation.id()));
    }

    #[test]
    fn test_overlay_blends_only_masked_pixels() {
        let image = RgbImage::from_pixel(2, 1, Rgb([100, 100, 100]));
        let mut mask = Array2::from_elem((1, 2), false);
        mask[[0, 0]] = true;

        let out = class_overlay(&image, &mask, Rgb([255, 0, 0]), 0.5);
        assert_eq!(out.get_pixel(0, 0).0, [177, 50, 50]);
        assert_eq!(out.get_pixel(1, 0).0, [100, 100, 100]);
    }

    #[test]
    fn test_spectral_classifier_separates_vegetation_and_water() {
        // Left half: bright NIR (vegetation in false color).
        // Right half: NIR far below red (strongly negative NDVI, water).
        let image = RgbImage::from_fn(16, 16, |x, _| {
            if x < 8 {
                Rgb([220, 60, 60])
            } else {
                Rgb([10, 90, 120])
            }
        });

        let classifier = SpectralClassifier::new();
        let mask = classifier.classify(&image).unwrap();

        assert_eq!(mask[[8, 2]], LandCoverClass::Vegetation.id());
        assert_eq!(mask[[8, 13]], LandCoverClass::Water.id());
    }
}
