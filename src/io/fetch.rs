use crate::config::Config;
use crate::io::cache::TileCacheStore;
use crate::types::{
    AccessToken, AcquiredTile, AcquisitionOutcome, BoundingBox, FallbackReason, TerraError,
    TerraResult,
};
use chrono::{Datelike, NaiveDate, Utc};
use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;

/// OAuth2 password-grant endpoint of the Copernicus Data Space
const TOKEN_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";

/// Sentinel Hub WMS base; the instance id is appended per request
const WMS_BASE: &str = "https://sh.dataspace.copernicus.eu/ogc/wms";

/// Public demo instance used when no instance id is configured
const DEFAULT_INSTANCE_ID: &str = "b874cadc-06ff-41f8-b1c3-4e567e6354c1";

/// Per-attempt HTTP timeout
const HTTP_TIMEOUT_SECS: u64 = 60;

/// Bounded retry for token and tile requests
const MAX_ATTEMPTS: u32 = 3;

/// Look this many days before the target date to tolerate revisit gaps
const ACQUISITION_WINDOW_DAYS: i64 = 60;

/// Safety margin subtracted from the reported token lifetime
const TOKEN_MARGIN_SECS: u64 = 60;

/// Below this pixel standard deviation an image counts as blank (no data)
const BLANK_STDDEV_THRESHOLD: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Tile acquisition client: cache read-through, authenticated WMS fetch,
/// and deterministic synthetic fallback.
///
/// No network or credential failure escapes [`TileFetcher::get_tile`];
/// every failure path terminates in a valid (possibly synthetic) raster.
pub struct TileFetcher {
    config: Config,
    client: reqwest::blocking::Client,
    token: Mutex<Option<AccessToken>>,
}

impl TileFetcher {
    pub fn new(config: Config) -> TerraResult<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(concat!("terrawatch/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy) = &config.http_proxy {
            builder = builder.proxy(
                reqwest::Proxy::http(proxy)
                    .map_err(|e| TerraError::Http(format!("invalid HTTP proxy: {}", e)))?,
            );
        }
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(
                reqwest::Proxy::https(proxy)
                    .map_err(|e| TerraError::Http(format!("invalid HTTPS proxy: {}", e)))?,
            );
        }

        let client = builder
            .build()
            .map_err(|e| TerraError::Http(format!("failed to create HTTP client: {}", e)))?;

        if !config.has_credentials() {
            log::warn!("imagery credentials not set; running in demo mode");
        }

        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    /// Obtain a raster for (bbox, date): cache first, then the imagery
    /// source, then the synthetic fallback. Always succeeds for network
    /// and credential failures; only cache I/O errors propagate.
    pub fn get_tile(
        &self,
        cache: &TileCacheStore,
        bbox: &BoundingBox,
        date: NaiveDate,
        size: (u32, u32),
    ) -> TerraResult<AcquiredTile> {
        if let Some(path) = cache.lookup(bbox, date)? {
            log::info!("cache hit for {}", date);
            return Ok(AcquiredTile {
                path,
                outcome: AcquisitionOutcome::CacheHit,
            });
        }

        let (image, outcome) = self.fetch_or_fallback(bbox, date, size);
        let path = cache.store(bbox, date, &image)?;
        Ok(AcquiredTile { path, outcome })
    }

    fn fetch_or_fallback(
        &self,
        bbox: &BoundingBox,
        date: NaiveDate,
        size: (u32, u32),
    ) -> (RgbImage, AcquisitionOutcome) {
        if !self.config.has_credentials() {
            log::info!("generating synthetic tile for {} (demo mode)", date);
            return (
                Self::synthetic_tile(bbox, date, size),
                AcquisitionOutcome::SyntheticFallback(FallbackReason::MissingCredentials),
            );
        }

        let token = match self.access_token() {
            Some(token) => token,
            None => {
                log::warn!("no access token available; falling back to synthetic imagery");
                return (
                    Self::synthetic_tile(bbox, date, size),
                    AcquisitionOutcome::SyntheticFallback(FallbackReason::TokenUnavailable),
                );
            }
        };

        match self.fetch_remote(&token, bbox, date, size) {
            Ok(image) => (image, AcquisitionOutcome::Fetched),
            Err(reason) => {
                log::warn!(
                    "tile fetch failed ({:?}); falling back to synthetic imagery",
                    reason
                );
                (
                    Self::synthetic_tile(bbox, date, size),
                    AcquisitionOutcome::SyntheticFallback(reason),
                )
            }
        }
    }

    /// Return a valid bearer token, refreshing only when absent or expired.
    /// Token acquisition failure degrades to `None` rather than an error.
    fn access_token(&self) -> Option<String> {
        let mut guard = self.token.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(token) = guard.as_ref() {
            if token.is_valid() {
                return Some(token.secret.clone());
            }
        }

        log::info!("requesting new access token");
        match self.request_token() {
            Ok(token) => {
                let secret = token.secret.clone();
                *guard = Some(token);
                Some(secret)
            }
            Err(e) => {
                log::error!("failed to obtain access token: {}", e);
                None
            }
        }
    }

    fn request_token(&self) -> Result<AccessToken, String> {
        let username = self
            .config
            .username
            .as_deref()
            .ok_or_else(|| "username not configured".to_string())?;
        let password = self
            .config
            .password
            .as_deref()
            .ok_or_else(|| "password not configured".to_string())?;

        let response = self.send_with_retry("token endpoint", || {
            self.client.post(TOKEN_URL).form(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
                ("client_id", "cdse-public"),
            ])
        })?;

        let body: TokenResponse = response
            .json()
            .map_err(|e| format!("malformed token response: {}", e))?;

        let expires_in = body.expires_in.unwrap_or(600);
        let usable = expires_in.saturating_sub(TOKEN_MARGIN_SECS);

        Ok(AccessToken {
            secret: body.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(usable as i64),
        })
    }

    fn fetch_remote(
        &self,
        token: &str,
        bbox: &BoundingBox,
        date: NaiveDate,
        size: (u32, u32),
    ) -> Result<RgbImage, FallbackReason> {
        // A wide date range ending just past the target day raises the odds
        // of a low-cloud acquisition anywhere on the globe.
        let start = date - chrono::Duration::days(ACQUISITION_WINDOW_DAYS);
        let end = date + chrono::Duration::days(1);
        let time_range = format!("{}/{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"));

        let instance = self
            .config
            .instance_id
            .as_deref()
            .unwrap_or(DEFAULT_INSTANCE_ID);
        let url = format!("{}/{}", WMS_BASE, instance);

        let width = size.0.to_string();
        let height = size.1.to_string();
        let maxcc = self.config.max_cloud_cover.to_string();
        let bbox_param = bbox.wms_string();

        log::info!("fetching imagery for {} over {}", date, bbox_param);

        let response = self
            .send_with_retry("imagery endpoint", || {
                self.client.get(&url).bearer_auth(token).query(&[
                    ("service", "WMS"),
                    ("version", "1.3.0"),
                    ("request", "GetMap"),
                    ("layers", "TRUE_COLOR"),
                    ("styles", ""),
                    ("format", "image/png"),
                    ("transparent", "false"),
                    ("width", width.as_str()),
                    ("height", height.as_str()),
                    ("crs", "EPSG:4326"),
                    ("bbox", bbox_param.as_str()),
                    ("time", time_range.as_str()),
                    ("maxcc", maxcc.as_str()),
                    ("priority", "leastCC"),
                ])
            })
            .map_err(FallbackReason::RequestFailed)?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("image") {
            return Err(FallbackReason::NonImageResponse(content_type));
        }

        let bytes = response
            .bytes()
            .map_err(|e| FallbackReason::RequestFailed(format!("failed to read body: {}", e)))?;

        let image = image::load_from_memory(&bytes)
            .map_err(|e| FallbackReason::NonImageResponse(format!("undecodable payload: {}", e)))?
            .to_rgb8();

        // A uniform response decodes fine but carries no data for this
        // location/date; treat it exactly like a failed request.
        let std_dev = pixel_stddev(&image);
        if std_dev < BLANK_STDDEV_THRESHOLD {
            log::warn!("imagery endpoint returned a blank tile (std={:.2})", std_dev);
            return Err(FallbackReason::BlankResponse);
        }

        log::info!("fetched tile (std={:.1})", std_dev);
        Ok(image)
    }

    /// One request with bounded retry: 429 and 5xx back off exponentially,
    /// other HTTP errors fail immediately, transport errors retry.
    fn send_with_retry<F>(
        &self,
        what: &str,
        build: F,
    ) -> Result<reqwest::blocking::Response, String>
    where
        F: Fn() -> reqwest::blocking::RequestBuilder,
    {
        let mut backoff = Duration::from_secs(1);
        let mut last_error = format!("{}: no attempt made", what);

        for attempt in 1..=MAX_ATTEMPTS {
            match build().send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    last_error = format!("{} returned HTTP {}", what, status.as_u16());
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable {
                        return Err(last_error);
                    }
                }
                Err(e) => {
                    last_error = format!("{} request failed: {}", what, e);
                }
            }

            if attempt < MAX_ATTEMPTS {
                log::warn!(
                    "{} attempt {} of {} failed, retrying in {:?}",
                    what,
                    attempt,
                    MAX_ATTEMPTS,
                    backoff
                );
                std::thread::sleep(backoff);
                backoff *= 2;
            }
        }

        Err(last_error)
    }

    /// Deterministic pseudo-terrain tile for (bbox, date).
    ///
    /// The banded base pattern and the bounded texture noise both derive
    /// from the same key, so repeated calls with identical inputs produce
    /// byte-identical rasters.
    pub fn synthetic_tile(bbox: &BoundingBox, date: NaiveDate, size: (u32, u32)) -> RgbImage {
        let (width, height) = size;
        let coord_hash = ((bbox.west() + bbox.south()) * 1000.0) as i64;
        let year = date.year() as i64;

        let mut rng = ChaCha8Rng::seed_from_u64(synthetic_seed(bbox, date));
        let mut image = RgbImage::new(width, height);

        for y in 0..height {
            for x in 0..width {
                let val = (x as i64 + y as i64 + coord_hash + year).rem_euclid(255);
                let base: [u8; 3] = if val < 100 {
                    [34, 139, 34] // vegetation
                } else if val < 150 {
                    [128, 128, 128] // urban
                } else if val < 180 {
                    [65, 105, 225] // water
                } else {
                    [139, 90, 43] // bare land
                };

                let mut pixel = [0u8; 3];
                for (out, b) in pixel.iter_mut().zip(base.iter()) {
                    let noise: i32 = rng.gen_range(-30..=30);
                    *out = (*b as i32 + noise).clamp(0, 255) as u8;
                }
                image.put_pixel(x, y, Rgb(pixel));
            }
        }

        image
    }
}

fn synthetic_seed(bbox: &BoundingBox, date: NaiveDate) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(bbox.key_string(date).as_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}

/// Standard deviation over every channel sample of the image
pub fn pixel_stddev(image: &RgbImage) -> f64 {
    let data = image.as_raw();
    if data.is_empty() {
        return 0.0;
    }

    let n = data.len() as f64;
    let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = data
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bbox() -> BoundingBox {
        BoundingBox::new(77.37, 12.734, 77.88, 13.173).unwrap()
    }

    #[test]
    fn test_synthetic_tile_is_deterministic() {
        let bbox = test_bbox();
        let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();

        let a = TileFetcher::synthetic_tile(&bbox, date, (64, 64));
        let b = TileFetcher::synthetic_tile(&bbox, date, (64, 64));
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_synthetic_tile_varies_with_date() {
        let bbox = test_bbox();
        let d1 = NaiveDate::from_ymd_opt(2020, 2, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();

        let a = TileFetcher::synthetic_tile(&bbox, d1, (64, 64));
        let b = TileFetcher::synthetic_tile(&bbox, d2, (64, 64));
        assert_ne!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_synthetic_tile_is_not_blank() {
        let bbox = test_bbox();
        let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let tile = TileFetcher::synthetic_tile(&bbox, date, (64, 64));
        assert!(pixel_stddev(&tile) >= BLANK_STDDEV_THRESHOLD);
    }

    #[test]
    fn test_stddev_of_uniform_image_is_zero() {
        let image = RgbImage::from_pixel(16, 16, Rgb([128, 128, 128]));
        assert!(pixel_stddev(&image) < f64::EPSILON);
    }
}
