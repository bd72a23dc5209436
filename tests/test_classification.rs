use image::{Rgb, RgbImage};
use terrawatch::core::classify::{class_percentage, mask_percentage, ndvi};
use terrawatch::core::{ClassRemapTable, LandCoverClassifier, SpectralClassifier};
use terrawatch::LandCoverClass;

/// NIR ramps left to right while red stays fixed, the canonical input for
/// checking that rising NDVI switches urban candidacy off and keeps it off.
fn nir_ramp(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, _| {
        let nir = (x * 2).min(255) as u8;
        Rgb([nir, 100, 100])
    })
}

#[test]
fn test_urban_candidates_vanish_past_ndvi_upper_bound() {
    let image = nir_ramp(128, 32);
    let classifier = SpectralClassifier::new();
    let (mask, _) = classifier.urban_mask(&image).unwrap();

    // NDVI crosses 0.25 where NIR > red * (1.25 / 0.75) ~ 166.7,
    // i.e. from column 84 onward.
    let bound_col = 84;
    for j in bound_col..128 {
        for i in 0..32 {
            assert!(
                !mask[[i, j]],
                "urban candidate at col {} beyond the NDVI upper bound",
                j
            );
        }
    }
}

#[test]
fn test_per_column_urban_counts_non_increasing_past_bound() {
    let image = nir_ramp(128, 32);
    let classifier = SpectralClassifier::new();
    let (mask, _) = classifier.urban_mask(&image).unwrap();

    let counts: Vec<usize> = (0..128)
        .map(|j| (0..32).filter(|&i| mask[[i, j]]).count())
        .collect();

    // Once a column drops to zero, every later column stays at zero.
    let first_zero_tail = counts
        .iter()
        .rposition(|&c| c > 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    assert!(counts[first_zero_tail..].iter().all(|&c| c == 0));
}

#[test]
fn test_ndvi_is_monotonic_in_nir() {
    let image = nir_ramp(128, 4);
    let nir = terrawatch::core::filters::channel(&image, 0);
    let red = terrawatch::core::filters::channel(&image, 1);
    let index = ndvi(&nir, &red);

    for j in 1..127 {
        assert!(
            index[[2, j + 1]] >= index[[2, j]],
            "NDVI must not decrease while NIR rises (col {})",
            j
        );
    }
}

#[test]
fn test_spectral_classifier_quadrant_scene() {
    // Four 16x16 quadrants: vegetation (bright NIR), water (NIR far below
    // red), dark shadow, and mid-brightness soil.
    let image = RgbImage::from_fn(32, 32, |x, y| match (x < 16, y < 16) {
        (true, true) => Rgb([230, 60, 60]),   // vegetation, NDVI ~ 0.59
        (false, true) => Rgb([5, 80, 110]),   // water, NDVI ~ -0.88
        (true, false) => Rgb([8, 8, 8]),      // near-black shadow
        (false, false) => Rgb([120, 110, 90]), // bare soil, NDVI ~ 0.04
    });

    let classifier = SpectralClassifier::new();
    let mask = classifier.classify(&image).unwrap();

    assert_eq!(mask[[4, 4]], LandCoverClass::Vegetation.id());
    assert_eq!(mask[[4, 24]], LandCoverClass::Water.id());
    assert_eq!(mask[[24, 4]], LandCoverClass::Background.id());

    let vegetation = class_percentage(&mask, LandCoverClass::Vegetation);
    let water = class_percentage(&mask, LandCoverClass::Water);
    assert!(vegetation >= 20.0, "vegetation quadrant: {:.1}%", vegetation);
    // Quadrant borders can vote urban through the texture path, so the
    // water share lands a little under its 25% quadrant.
    assert!(water >= 12.0, "water quadrant: {:.1}%", water);
}

#[test]
fn test_urban_change_report_on_identical_inputs() {
    let image = RgbImage::from_fn(32, 32, |x, y| {
        Rgb([((x * 7 + y * 3) % 200) as u8 + 20, 80, 90])
    });

    let classifier = SpectralClassifier::new();
    let report = classifier.analyze_urban_change(&image, &image, 10.0).unwrap();

    assert!((report.change_percent).abs() < 1e-9);
    assert_eq!(report.new_urban_pixels, 0);
    assert_eq!(report.before_area.pixels, report.after_area.pixels);
    assert_eq!(report.before_overlay.dimensions(), (32, 32));
}

#[test]
fn test_urban_change_report_rejects_extent_mismatch() {
    let a = RgbImage::from_fn(32, 32, |x, _| Rgb([x as u8, 80, 90]));
    let b = RgbImage::from_fn(16, 16, |x, _| Rgb([x as u8, 80, 90]));

    let classifier = SpectralClassifier::new();
    assert!(classifier.analyze_urban_change(&a, &b, 10.0).is_err());
}

#[test]
fn test_remap_table_round_trips_known_classes() {
    let table = ClassRemapTable::ade20k_default()
        .with_entry(42, LandCoverClass::Road);

    assert_eq!(table.remap(42), LandCoverClass::Road);
    assert_eq!(table.remap(3), LandCoverClass::Urban);
    assert_eq!(table.remap(999), LandCoverClass::Background);
}

#[test]
fn test_mask_percentage_bounds() {
    let all = ndarray::Array2::from_elem((8, 8), true);
    let none = ndarray::Array2::from_elem((8, 8), false);
    assert!((mask_percentage(&all) - 100.0).abs() < 1e-9);
    assert!(mask_percentage(&none).abs() < 1e-9);
}
