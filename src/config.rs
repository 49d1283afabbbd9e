//! Process configuration
//!
//! Every recognized `GV_*` variable is read exactly once, at startup, into a
//! [`Config`] record which is then passed by reference to each component.

use crate::core::enhance::EnhanceParams;
use crate::types::{GeoBox, GvError, GvResult, RegionOfInterest, Vantage};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_S3_PREFIX: &str = "ABI-L2-MCMIPC";
pub const DEFAULT_SOURCE_BUCKET: &str = "noaa-goes16";
pub const DEFAULT_CONTRAST: f32 = 105.0;
pub const DEFAULT_TILE_SOURCE: &str = "https://stamen-tiles.a.ssl.fastly.net/toner-lite";
pub const DEFAULT_FILE_NAME: &str = "index.html";
pub const DEFAULT_FIG_DIR: &str = "figs/";
pub const DEFAULT_OBJECT_ENDPOINT: &str = "https://{bucket}.s3.amazonaws.com";

/// Subset presets, (lon, lat) corners
pub const EAST_CORNERS: [(f64, f64); 2] = [(-116.0, 30.0), (-102.0, 38.0)];
pub const WEST_CORNERS: [(f64, f64); 2] = [(-116.0, 38.0), (-102.0, 30.0)];

/// Which delivery coordinator the process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Queue,
    Poll,
}

impl std::str::FromStr for Mode {
    type Err = GvError;

    fn from_str(s: &str) -> GvResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "queue" | "sqs" => Ok(Mode::Queue),
            "poll" | "s3" => Ok(Mode::Poll),
            other => Err(GvError::Config(format!("Unknown GV_MODE: {}", other))),
        }
    }
}

/// Explicit configuration record
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub source_prefix: String,
    pub source_bucket: String,
    pub queue_url: Option<String>,
    pub contrast: f32,
    /// Dashboard basemap, passed through to the dashboard collaborator
    pub tile_source: String,
    pub lon_limits: (f64, f64),
    pub lat_limits: (f64, f64),
    /// Dashboard page name, passed through to the dashboard collaborator
    pub dashboard_file: String,
    pub output_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub retention: chrono::Duration,
    pub max_images: usize,
    pub lease: Duration,
    pub request_timeout: Duration,
    pub queue_idle: Duration,
    pub grid_spacing: f64,
    pub search_radius: f64,
    pub object_endpoint: String,
    pub east_corners: [(f64, f64); 2],
    pub west_corners: [(f64, f64); 2],
    pub enhance: EnhanceParams,
}

impl Default for Config {
    fn default() -> Self {
        let output_dir = PathBuf::from(DEFAULT_FIG_DIR);
        Self {
            mode: Mode::Queue,
            source_prefix: DEFAULT_S3_PREFIX.to_string(),
            source_bucket: DEFAULT_SOURCE_BUCKET.to_string(),
            queue_url: None,
            contrast: DEFAULT_CONTRAST,
            tile_source: DEFAULT_TILE_SOURCE.to_string(),
            lon_limits: (-115.0, -103.0),
            lat_limits: (31.0, 37.0),
            dashboard_file: DEFAULT_FILE_NAME.to_string(),
            lock_dir: output_dir.join(".locks"),
            output_dir,
            retention: chrono::Duration::hours(24),
            max_images: 48,
            lease: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            queue_idle: Duration::from_secs(5),
            grid_spacing: 2500.0,
            search_radius: 6000.0,
            object_endpoint: DEFAULT_OBJECT_ENDPOINT.to_string(),
            east_corners: EAST_CORNERS,
            west_corners: WEST_CORNERS,
            enhance: EnhanceParams::default(),
        }
    }
}

impl Config {
    /// Build from the process environment
    pub fn from_env() -> GvResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> GvResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(v) = lookup("GV_MODE") {
            config.mode = v.parse()?;
        }
        if let Some(v) = lookup("GV_S3_PREFIX") {
            config.source_prefix = v;
        }
        if let Some(v) = lookup("GV_SOURCE_BUCKET") {
            config.source_bucket = v;
        }
        config.queue_url = lookup("GV_SQS_URL").filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup("GV_CONTRAST") {
            config.contrast = parse_number("GV_CONTRAST", &v)?;
        }
        if let Some(v) = lookup("GV_TILE_SOURCE") {
            config.tile_source = v;
        }
        if let Some(v) = lookup("GV_LON_LIMITS") {
            config.lon_limits = parse_pair("GV_LON_LIMITS", &v)?;
        }
        if let Some(v) = lookup("GV_LAT_LIMITS") {
            config.lat_limits = parse_pair("GV_LAT_LIMITS", &v)?;
        }
        if let Some(v) = lookup("GV_FILE_NAME") {
            config.dashboard_file = v;
        }
        if let Some(v) = lookup("GV_FIG_DIR") {
            config.output_dir = PathBuf::from(v);
        }
        config.lock_dir = match lookup("GV_LOCK_DIR") {
            Some(v) => PathBuf::from(v),
            None => config.output_dir.join(".locks"),
        };
        if let Some(v) = lookup("GV_RETENTION_HOURS") {
            let hours: f64 = parse_number("GV_RETENTION_HOURS", &v)?;
            if !hours.is_finite() || hours <= 0.0 {
                return Err(GvError::Config(format!(
                    "GV_RETENTION_HOURS must be a positive number of hours, got '{}'",
                    v
                )));
            }
            config.retention = chrono::Duration::try_seconds((hours * 3600.0).round() as i64)
                .ok_or_else(|| GvError::Config(format!("GV_RETENTION_HOURS out of range: '{}'", v)))?;
        }
        if let Some(v) = lookup("GV_MAX_IMAGES") {
            config.max_images = parse_number("GV_MAX_IMAGES", &v)?;
        }
        if let Some(v) = lookup("GV_LEASE_SECONDS") {
            config.lease = Duration::from_secs(parse_number("GV_LEASE_SECONDS", &v)?);
        }
        if let Some(v) = lookup("GV_REQUEST_TIMEOUT") {
            config.request_timeout = Duration::from_secs(parse_number("GV_REQUEST_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("GV_QUEUE_IDLE_SECONDS") {
            config.queue_idle = Duration::from_secs(parse_number("GV_QUEUE_IDLE_SECONDS", &v)?);
        }
        if let Some(v) = lookup("GV_GRID_SPACING") {
            config.grid_spacing = parse_number("GV_GRID_SPACING", &v)?;
        }
        if let Some(v) = lookup("GV_SEARCH_RADIUS") {
            config.search_radius = parse_number("GV_SEARCH_RADIUS", &v)?;
        }
        if let Some(v) = lookup("GV_OBJECT_ENDPOINT") {
            config.object_endpoint = v;
        }
        if let Some(v) = lookup("GV_ROI_EAST") {
            config.east_corners = parse_corners("GV_ROI_EAST", &v)?;
        }
        if let Some(v) = lookup("GV_ROI_WEST") {
            config.west_corners = parse_corners("GV_ROI_WEST", &v)?;
        }
        if let Some(v) = lookup("GV_ENHANCE") {
            config.enhance = serde_json::from_str(&v)
                .map_err(|e| GvError::Config(format!("GV_ENHANCE is not valid JSON: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GvResult<()> {
        if self.grid_spacing <= 0.0 {
            return Err(GvError::Config("GV_GRID_SPACING must be positive".to_string()));
        }
        if self.search_radius <= 0.0 {
            return Err(GvError::Config("GV_SEARCH_RADIUS must be positive".to_string()));
        }
        if self.contrast >= 259.0 {
            return Err(GvError::Config(format!(
                "GV_CONTRAST must be below 259, got {}",
                self.contrast
            )));
        }
        if self.retention <= chrono::Duration::zero() {
            return Err(GvError::Config("GV_RETENTION_HOURS must be positive".to_string()));
        }
        if self.max_images == 0 {
            return Err(GvError::Config("GV_MAX_IMAGES must be at least 1".to_string()));
        }
        if self.lease.as_secs() < 2 {
            return Err(GvError::Config("GV_LEASE_SECONDS must be at least 2".to_string()));
        }
        self.enhance.validate()
    }

    /// Region of interest for a vantage point, map extent from the configured limits
    pub fn region(&self, vantage: Vantage) -> RegionOfInterest {
        let corners = match vantage {
            Vantage::East => self.east_corners,
            Vantage::West => self.west_corners,
        };
        RegionOfInterest {
            subset: GeoBox::from_corners(corners[0], corners[1]),
            map_extent: GeoBox::from_corners(
                (self.lon_limits.0, self.lat_limits.0),
                (self.lon_limits.1, self.lat_limits.1),
            ),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> GvResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| GvError::Config(format!("{} has invalid value '{}': {}", key, value, e)))
}

fn parse_pair(key: &str, value: &str) -> GvResult<(f64, f64)> {
    let parts = value
        .split(',')
        .map(|s| parse_number::<f64>(key, s))
        .collect::<GvResult<Vec<_>>>()?;
    match parts.as_slice() {
        [a, b] => Ok((*a, *b)),
        _ => Err(GvError::Config(format!(
            "{} must hold exactly two comma-separated numbers, got '{}'",
            key, value
        ))),
    }
}

fn parse_corners(key: &str, value: &str) -> GvResult<[(f64, f64); 2]> {
    let corners: [[f64; 2]; 2] = serde_json::from_str(value).map_err(|e| {
        GvError::Config(format!("{} must be JSON [[lon,lat],[lon,lat]]: {}", key, e))
    })?;
    Ok([
        (corners[0][0], corners[0][1]),
        (corners[1][0], corners[1][1]),
    ])
}
