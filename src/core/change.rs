//! Change detection between two acquisitions.
//!
//! Two granularities share the area-conversion and severity rules:
//! categorical transition counting over class masks, and a raw
//! pixel-difference mode for when only imagery is available. The two
//! modes use different signals and are deliberately independent; they
//! may disagree on the same inputs.

use crate::core::classify::class_overlay;
use crate::core::filters::{self, BoolMask};
use crate::types::{
    ChangeStats, ClassMask, Confidence, LandCoverClass, Severity, TerraError, TerraResult,
};
use image::{Rgb, RgbImage};
use ndarray::Array2;
use std::collections::BTreeMap;

/// Below this standard deviation an input raster is considered blank.
/// A blank input is a terminal rejection, not a retryable error.
const BLANK_STDDEV_THRESHOLD: f64 = 1.0;

/// Blur scores below this mark an image as blurry
const BLUR_THRESHOLD: f64 = 100.0;

/// One named change category: a set of source classes and a set of
/// destination classes. Categories are independent; a pixel may count
/// toward several of them.
#[derive(Debug, Clone)]
pub struct ChangeCategory {
    pub key: String,
    pub name: String,
    pub from: Vec<LandCoverClass>,
    pub to: Vec<LandCoverClass>,
    pub color: [u8; 3],
}

impl ChangeCategory {
    fn from_lut(&self) -> [bool; 6] {
        let mut lut = [false; 6];
        for class in &self.from {
            lut[class.id() as usize] = true;
        }
        lut
    }

    fn to_lut(&self) -> [bool; 6] {
        let mut lut = [false; 6];
        for class in &self.to {
            lut[class.id() as usize] = true;
        }
        lut
    }
}

/// The standard category set for land-cover transition analysis
pub fn default_change_categories() -> Vec<ChangeCategory> {
    use LandCoverClass::*;
    vec![
        ChangeCategory {
            key: "deforestation".to_string(),
            name: "Deforestation".to_string(),
            from: vec![Vegetation],
            to: vec![Urban, BareSoil, Road],
            color: [255, 0, 0],
        },
        ChangeCategory {
            key: "construction".to_string(),
            name: "New Construction".to_string(),
            from: vec![Vegetation, BareSoil],
            to: vec![Urban],
            color: [0, 0, 255],
        },
        ChangeCategory {
            key: "new_roads".to_string(),
            name: "New Roads".to_string(),
            from: vec![Vegetation, BareSoil],
            to: vec![Road],
            color: [255, 255, 0],
        },
        ChangeCategory {
            key: "water_loss".to_string(),
            name: "Water Bodies Drying".to_string(),
            from: vec![Water],
            to: vec![Urban, Vegetation, BareSoil],
            color: [128, 0, 128],
        },
        ChangeCategory {
            key: "vegetation_gain".to_string(),
            name: "Vegetation Increase".to_string(),
            from: vec![BareSoil],
            to: vec![Vegetation],
            color: [0, 255, 0],
        },
    ]
}

/// Usability report for one input raster
#[derive(Debug, Clone)]
pub struct QualityReport {
    pub is_valid: bool,
    pub reason: Option<String>,
    pub std_dev: f64,
    pub mean_intensity: f64,
    pub blur_score: f64,
    pub is_blurry: bool,
    pub tier: QualityTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Good,
    Acceptable,
    Poor,
}

/// Check whether a raster is usable for analysis
pub fn check_image_quality(image: &RgbImage) -> QualityReport {
    let std_dev = crate::io::pixel_stddev(image);
    let data = image.as_raw();
    let mean_intensity = if data.is_empty() {
        0.0
    } else {
        data.iter().map(|&v| v as f64).sum::<f64>() / data.len() as f64
    };

    if std_dev < BLANK_STDDEV_THRESHOLD {
        return QualityReport {
            is_valid: false,
            reason: Some("image is completely blank (uniform color)".to_string()),
            std_dev,
            mean_intensity,
            blur_score: 0.0,
            is_blurry: true,
            tier: QualityTier::Poor,
        };
    }

    let gray = filters::grayscale(image);
    let blur_score = filters::laplacian_variance(&gray);
    let tier = if blur_score > 300.0 {
        QualityTier::Good
    } else if blur_score > BLUR_THRESHOLD {
        QualityTier::Acceptable
    } else {
        QualityTier::Poor
    };

    QualityReport {
        is_valid: true,
        reason: None,
        std_dev,
        mean_intensity,
        blur_score,
        is_blurry: blur_score < BLUR_THRESHOLD,
        tier,
    }
}

/// Result of categorical transition counting over two class masks
#[derive(Debug, Clone)]
pub struct ClassChangeReport {
    /// Per-category statistics, keyed by category key
    pub stats: BTreeMap<String, ChangeStats>,
    /// RGB transition map: gray = unchanged, category colors elsewhere
    pub visualization: RgbImage,
}

/// Result of the raw pixel-difference mode
#[derive(Debug, Clone)]
pub struct PixelChangeReport {
    pub total_pixels: u64,
    pub changed_pixels: u64,
    pub change_percentage: f64,
    pub severity: Severity,
    pub change_type: String,
    pub confidence: Confidence,
    pub area: ChangeStats,
    pub overlay: RgbImage,
    pub change_mask: BoolMask,
}

/// Multi-mode change detector sharing resolution and severity rules
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    resolution_m: f64,
    sensitivity: f32,
    enhance: bool,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self {
            resolution_m: 10.0,
            sensitivity: 30.0,
            enhance: false,
        }
    }
}

impl ChangeDetector {
    pub fn new(resolution_m: f64) -> Self {
        Self {
            resolution_m,
            ..Self::default()
        }
    }

    /// Absolute-difference threshold for the raw pixel mode (0-255 scale)
    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    /// Sharpen and contrast-stretch inputs before differencing
    pub fn with_enhancement(mut self, enhance: bool) -> Self {
        self.enhance = enhance;
        self
    }

    pub fn resolution_m(&self) -> f64 {
        self.resolution_m
    }

    /// Count class transitions for each category.
    ///
    /// Categories are independent; a pixel may count toward several.
    pub fn detect_class_changes(
        &self,
        before: &ClassMask,
        after: &ClassMask,
        categories: &[ChangeCategory],
    ) -> TerraResult<ClassChangeReport> {
        if before.dim() != after.dim() {
            return Err(TerraError::RejectedInput(format!(
                "class mask extents differ: {:?} vs {:?}",
                before.dim(),
                after.dim()
            )));
        }

        let (height, width) = before.dim();
        let mut visualization = RgbImage::new(width as u32, height as u32);
        let mut stats = BTreeMap::new();

        // Unchanged pixels render gray; categorized changes overwrite below.
        for i in 0..height {
            for j in 0..width {
                if before[[i, j]] == after[[i, j]] {
                    visualization.put_pixel(j as u32, i as u32, Rgb([200, 200, 200]));
                }
            }
        }

        for category in categories {
            let from_lut = category.from_lut();
            let to_lut = category.to_lut();
            let mut count: u64 = 0;

            for i in 0..height {
                for j in 0..width {
                    let b = before[[i, j]] as usize;
                    let a = after[[i, j]] as usize;
                    if b < 6 && a < 6 && from_lut[b] && to_lut[a] {
                        count += 1;
                        visualization.put_pixel(j as u32, i as u32, Rgb(category.color));
                    }
                }
            }

            log::debug!("category {}: {} pixels changed", category.key, count);
            stats.insert(
                category.key.clone(),
                ChangeStats::from_pixels(count, self.resolution_m),
            );
        }

        Ok(ClassChangeReport {
            stats,
            visualization,
        })
    }

    /// Grayscale absolute-difference change detection on raw imagery.
    ///
    /// Blank inputs and extent mismatches are terminal rejections:
    /// retrying with the same inputs cannot succeed.
    pub fn detect_pixel_changes(
        &self,
        before: &RgbImage,
        after: &RgbImage,
    ) -> TerraResult<PixelChangeReport> {
        for (label, image) in [("before", before), ("after", after)] {
            let quality = check_image_quality(image);
            if !quality.is_valid {
                return Err(TerraError::RejectedInput(format!(
                    "{} image unusable: {} (std={:.2})",
                    label,
                    quality.reason.unwrap_or_default(),
                    quality.std_dev
                )));
            }
        }

        if before.dimensions() != after.dimensions() {
            return Err(TerraError::RejectedInput(format!(
                "raster extents differ: {:?} vs {:?}",
                before.dimensions(),
                after.dimensions()
            )));
        }

        let (diff_before, diff_after) = if self.enhance {
            (enhance_image(before), enhance_image(after))
        } else {
            (before.clone(), after.clone())
        };

        let gray_before = filters::grayscale(&diff_before);
        let gray_after = filters::grayscale(&diff_after);

        let raw_mask: BoolMask = Array2::from_shape_fn(gray_before.dim(), |(i, j)| {
            (gray_before[[i, j]] - gray_after[[i, j]]).abs() > self.sensitivity
        });

        // Open removes isolated flips, close re-fills legitimate regions.
        let change_mask = filters::close(&filters::open(&raw_mask, 5), 5);

        let total_pixels = change_mask.len() as u64;
        let changed_pixels = change_mask.iter().filter(|&&v| v).count() as u64;
        let change_percentage = changed_pixels as f64 / total_pixels as f64 * 100.0;
        let severity = Severity::from_change_percentage(change_percentage);

        // Color heuristics read the unenhanced inputs so enhancement
        // cannot skew the class averages.
        let (change_type, confidence) = classify_change_type(before, after, &change_mask);

        log::info!(
            "pixel diff: {:.2}% changed ({} px), severity {}, type {:?}",
            change_percentage,
            changed_pixels,
            severity,
            change_type
        );

        Ok(PixelChangeReport {
            total_pixels,
            changed_pixels,
            change_percentage,
            severity,
            change_type,
            confidence,
            area: ChangeStats::from_pixels(changed_pixels, self.resolution_m),
            overlay: class_overlay(after, &change_mask, Rgb([255, 0, 0]), 0.4),
            change_mask,
        })
    }
}

/// Sharpen plus percentile contrast stretch (the optional-enhance stage)
pub fn enhance_image(image: &RgbImage) -> RgbImage {
    filters::stretch_contrast(&filters::sharpen(image), 2.0, 98.0)
}

/// Mean RGB over the flagged pixels only
fn mean_rgb_over_mask(image: &RgbImage, mask: &BoolMask) -> Option<[f64; 3]> {
    let mut sums = [0.0f64; 3];
    let mut count = 0u64;

    for (y, x) in mask
        .indexed_iter()
        .filter_map(|((i, j), &set)| set.then_some((i, j)))
    {
        let p = image.get_pixel(x as u32, y as u32).0;
        for c in 0..3 {
            sums[c] += p[c] as f64;
        }
        count += 1;
    }

    if count == 0 {
        return None;
    }
    Some([
        sums[0] / count as f64,
        sums[1] / count as f64,
        sums[2] / count as f64,
    ])
}

fn is_green(avg: &[f64; 3]) -> bool {
    avg[1] > avg[0] * 1.1 && avg[1] > avg[2] * 1.1
}

fn is_gray(avg: &[f64; 3]) -> bool {
    let max = avg[0].max(avg[1]).max(avg[2]);
    let min = avg[0].min(avg[1]).min(avg[2]);
    let mean = (avg[0] + avg[1] + avg[2]) / 3.0;
    max - min < 30.0 && mean > 100.0
}

/// Qualitative change type from average colors of the changed region
fn classify_change_type(
    before: &RgbImage,
    after: &RgbImage,
    mask: &BoolMask,
) -> (String, Confidence) {
    let before_avg = mean_rgb_over_mask(before, mask);
    let after_avg = mean_rgb_over_mask(after, mask);

    let (before_avg, after_avg) = match (before_avg, after_avg) {
        (Some(b), Some(a)) => (b, a),
        _ => return ("No significant change".to_string(), Confidence::Low),
    };

    let before_green = is_green(&before_avg);
    let after_green = is_green(&after_avg);
    let before_gray = is_gray(&before_avg);
    let after_gray = is_gray(&after_avg);

    if before_green && after_gray {
        (
            "Possible Construction (Vegetation → Urban)".to_string(),
            Confidence::Medium,
        )
    } else if before_green && !after_green {
        (
            "Possible Deforestation (Vegetation Loss)".to_string(),
            Confidence::Medium,
        )
    } else if !before_gray && after_gray {
        (
            "Possible Urban Development".to_string(),
            Confidence::Medium,
        )
    } else if after_green && !before_green {
        (
            "Possible Greening (Vegetation Increase)".to_string(),
            Confidence::Medium,
        )
    } else {
        ("General change detected".to_string(), Confidence::Low)
    }
}
