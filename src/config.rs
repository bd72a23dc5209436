use std::path::PathBuf;

/// Environment-provided configuration for the acquisition and analysis core.
///
/// The core consumes these settings but does not own them; callers may build
/// a `Config` by hand (tests do) or read it from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Copernicus Data Space username; demo mode when absent
    pub username: Option<String>,
    /// Copernicus Data Space password; demo mode when absent
    pub password: Option<String>,
    /// Sentinel Hub WMS instance id
    pub instance_id: Option<String>,
    /// Proxy for plain-HTTP requests
    pub http_proxy: Option<String>,
    /// Proxy for HTTPS requests
    pub https_proxy: Option<String>,
    /// Directory holding the tile cache database and image files
    pub cache_dir: PathBuf,
    /// Tile edge length in pixels
    pub tile_size: u32,
    /// Target ground resolution in meters per pixel
    pub resolution_m: f64,
    /// Maximum acceptable cloud cover percentage for fetched imagery
    pub max_cloud_cover: u8,
    /// Cache entry lifetime in days
    pub cache_expire_days: i64,
}

impl Config {
    /// Read configuration from the process environment, falling back to the
    /// same defaults the hosted deployment uses.
    pub fn from_env() -> Self {
        let cache_dir = std::env::var("TILE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_cache_dir());

        Self {
            username: non_empty(std::env::var("COPERNICUS_USERNAME").ok()),
            password: non_empty(std::env::var("COPERNICUS_PASSWORD").ok()),
            instance_id: non_empty(std::env::var("SENTINEL_HUB_INSTANCE_ID").ok()),
            http_proxy: non_empty(
                std::env::var("HTTP_PROXY")
                    .or_else(|_| std::env::var("http_proxy"))
                    .ok(),
            ),
            https_proxy: non_empty(
                std::env::var("HTTPS_PROXY")
                    .or_else(|_| std::env::var("https_proxy"))
                    .ok(),
            ),
            cache_dir,
            tile_size: std::env::var("TILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(512),
            resolution_m: 10.0,
            max_cloud_cover: std::env::var("MAX_CLOUD_COVER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            cache_expire_days: 30,
        }
    }

    /// Demo-mode configuration rooted at the given cache directory
    pub fn demo(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            username: None,
            password: None,
            instance_id: None,
            http_proxy: None,
            https_proxy: None,
            cache_dir: cache_dir.into(),
            tile_size: 512,
            resolution_m: 10.0,
            max_cloud_cover: 50,
            cache_expire_days: 30,
        }
    }

    /// True when credentials for the imagery source are configured
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("terrawatch")
            .join("tile_cache")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
