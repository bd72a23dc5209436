//! Pixel-level building blocks shared by the classifier and the change
//! detector: grayscale reduction, percentiles, edge detection, binary
//! morphology, and the optional enhancement kernels.

use crate::types::BandImage;
use image::{Rgb, RgbImage};
use ndarray::Array2;

/// Binary pixel mask with the same extent as its source raster
pub type BoolMask = Array2<bool>;

/// Extract one channel of an RGB raster as f32
pub fn channel(image: &RgbImage, index: usize) -> BandImage {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32).0[index] as f32
    })
}

/// Grayscale intensity as the per-pixel channel mean
pub fn grayscale(image: &RgbImage) -> BandImage {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        let p = image.get_pixel(x as u32, y as u32).0;
        (p[0] as f32 + p[1] as f32 + p[2] as f32) / 3.0
    })
}

/// Linearly interpolated percentile of a band, `p` in [0, 100].
///
/// Empty input yields 0.0; NaN samples are excluded.
pub fn percentile(band: &BandImage, p: f64) -> f32 {
    let mut values: Vec<f32> = band.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return values[lo];
    }
    let frac = (rank - lo as f64) as f32;
    values[lo] * (1.0 - frac) + values[hi] * frac
}

/// Sobel gradient magnitude; border pixels are zero
pub fn sobel_magnitude(gray: &BandImage) -> BandImage {
    let (height, width) = gray.dim();
    let mut magnitude = Array2::zeros((height, width));
    if height < 3 || width < 3 {
        return magnitude;
    }

    for i in 1..height - 1 {
        for j in 1..width - 1 {
            let gx = gray[[i - 1, j + 1]] + 2.0 * gray[[i, j + 1]] + gray[[i + 1, j + 1]]
                - gray[[i - 1, j - 1]]
                - 2.0 * gray[[i, j - 1]]
                - gray[[i + 1, j - 1]];
            let gy = gray[[i + 1, j - 1]] + 2.0 * gray[[i + 1, j]] + gray[[i + 1, j + 1]]
                - gray[[i - 1, j - 1]]
                - 2.0 * gray[[i - 1, j]]
                - gray[[i - 1, j + 1]];
            magnitude[[i, j]] = (gx * gx + gy * gy).sqrt();
        }
    }
    magnitude
}

/// Pixels whose gradient magnitude exceeds the threshold
pub fn edge_mask(gray: &BandImage, threshold: f32) -> BoolMask {
    sobel_magnitude(gray).mapv(|m| m > threshold)
}

/// Binary dilation with a `kernel` x `kernel` structuring element
/// (odd kernel; out-of-bounds neighbors are ignored)
pub fn dilate(mask: &BoolMask, kernel: usize) -> BoolMask {
    morphology_pass(mask, kernel, |any, _all| any)
}

/// Binary erosion with a `kernel` x `kernel` structuring element
pub fn erode(mask: &BoolMask, kernel: usize) -> BoolMask {
    morphology_pass(mask, kernel, |_any, all| all)
}

/// Erosion followed by dilation; removes isolated speckle
pub fn open(mask: &BoolMask, kernel: usize) -> BoolMask {
    dilate(&erode(mask, kernel), kernel)
}

/// Dilation followed by erosion; fills pinholes
pub fn close(mask: &BoolMask, kernel: usize) -> BoolMask {
    erode(&dilate(mask, kernel), kernel)
}

fn morphology_pass<F>(mask: &BoolMask, kernel: usize, combine: F) -> BoolMask
where
    F: Fn(bool, bool) -> bool,
{
    let (height, width) = mask.dim();
    let half = (kernel / 2) as i32;
    let mut out = Array2::from_elem((height, width), false);

    for i in 0..height {
        for j in 0..width {
            let mut any = false;
            let mut all = true;
            for di in -half..=half {
                for dj in -half..=half {
                    let ni = i as i32 + di;
                    let nj = j as i32 + dj;
                    if ni < 0 || ni >= height as i32 || nj < 0 || nj >= width as i32 {
                        continue;
                    }
                    if mask[[ni as usize, nj as usize]] {
                        any = true;
                    } else {
                        all = false;
                    }
                }
            }
            out[[i, j]] = combine(any, all);
        }
    }
    out
}

/// 3x3 sharpening convolution, channel-wise with clamping
pub fn sharpen(image: &RgbImage) -> RgbImage {
    const KERNEL: [[f32; 3]; 3] = [[-1.0, -1.0, -1.0], [-1.0, 9.0, -1.0], [-1.0, -1.0, -1.0]];

    let (width, height) = image.dimensions();
    let mut out = RgbImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let mut acc = [0.0f32; 3];
            for (ki, row) in KERNEL.iter().enumerate() {
                for (kj, &weight) in row.iter().enumerate() {
                    // Clamp-to-edge keeps borders from darkening.
                    let sy = (y as i32 + ki as i32 - 1).clamp(0, height as i32 - 1) as u32;
                    let sx = (x as i32 + kj as i32 - 1).clamp(0, width as i32 - 1) as u32;
                    let p = image.get_pixel(sx, sy).0;
                    for c in 0..3 {
                        acc[c] += weight * p[c] as f32;
                    }
                }
            }
            out.put_pixel(
                x,
                y,
                Rgb([
                    acc[0].clamp(0.0, 255.0) as u8,
                    acc[1].clamp(0.0, 255.0) as u8,
                    acc[2].clamp(0.0, 255.0) as u8,
                ]),
            );
        }
    }
    out
}

/// Percentile-based contrast stretch: per channel, map the [low, high]
/// percentile range onto the full 0-255 scale
pub fn stretch_contrast(image: &RgbImage, low_pct: f64, high_pct: f64) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut bounds = [(0.0f32, 255.0f32); 3];

    for (c, bound) in bounds.iter_mut().enumerate() {
        let band = channel(image, c);
        let low = percentile(&band, low_pct);
        let high = percentile(&band, high_pct);
        *bound = if high - low < 1.0 { (low, low + 1.0) } else { (low, high) };
    }

    let mut out = RgbImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let p = image.get_pixel(x, y).0;
            let mut stretched = [0u8; 3];
            for c in 0..3 {
                let (low, high) = bounds[c];
                let scaled = (p[c] as f32 - low) / (high - low) * 255.0;
                stretched[c] = scaled.clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(x, y, Rgb(stretched));
        }
    }
    out
}

/// Variance of the 4-neighbor Laplacian; low values indicate blur
pub fn laplacian_variance(gray: &BandImage) -> f64 {
    let (height, width) = gray.dim();
    if height < 3 || width < 3 {
        return 0.0;
    }

    let mut responses = Vec::with_capacity((height - 2) * (width - 2));
    for i in 1..height - 1 {
        for j in 1..width - 1 {
            let lap = gray[[i - 1, j]] + gray[[i + 1, j]] + gray[[i, j - 1]] + gray[[i, j + 1]]
                - 4.0 * gray[[i, j]];
            responses.push(lap as f64);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_percentile_interpolation() {
        let band = Array2::from_shape_vec((1, 5), vec![0.0, 10.0, 20.0, 30.0, 40.0]).unwrap();
        assert_abs_diff_eq!(percentile(&band, 0.0), 0.0);
        assert_abs_diff_eq!(percentile(&band, 50.0), 20.0);
        assert_abs_diff_eq!(percentile(&band, 100.0), 40.0);
        assert_abs_diff_eq!(percentile(&band, 25.0), 10.0);
        assert_abs_diff_eq!(percentile(&band, 40.0), 16.0, epsilon = 1e-4);
    }

    #[test]
    fn test_erode_removes_isolated_pixel() {
        let mut mask = Array2::from_elem((7, 7), false);
        mask[[3, 3]] = true;
        let eroded = erode(&mask, 3);
        assert!(eroded.iter().all(|&v| !v));
    }

    #[test]
    fn test_open_removes_speckle_close_fills_hole() {
        // Solid block with one pinhole, plus a lone interior speckle pixel.
        let mut mask = Array2::from_elem((12, 12), false);
        for i in 1..6 {
            for j in 1..6 {
                mask[[i, j]] = true;
            }
        }
        mask[[3, 3]] = false;
        mask[[8, 8]] = true;

        let cleaned = open(&close(&mask, 3), 3);
        assert!(cleaned[[3, 3]], "pinhole should be filled by close");
        assert!(!cleaned[[8, 8]], "speckle should be removed by open");
    }

    #[test]
    fn test_morphology_preserves_uniform_mask() {
        let mask = Array2::from_elem((6, 6), true);
        let opened = open(&mask, 5);
        let closed = close(&opened, 5);
        assert!(closed.iter().all(|&v| v));
    }

    #[test]
    fn test_sobel_flags_vertical_edge() {
        let gray = Array2::from_shape_fn((8, 8), |(_, j)| if j < 4 { 0.0 } else { 200.0 });
        let edges = edge_mask(&gray, 100.0);
        assert!(edges[[4, 4]] || edges[[4, 3]]);
        assert!(!edges[[4, 1]]);
    }

    #[test]
    fn test_laplacian_variance_orders_sharpness() {
        let flat = Array2::from_elem((16, 16), 100.0);
        let textured = Array2::from_shape_fn((16, 16), |(i, j)| ((i * 31 + j * 17) % 97) as f32);
        assert!(laplacian_variance(&flat) < laplacian_variance(&textured));
    }
}
