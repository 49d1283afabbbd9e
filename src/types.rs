use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

/// Reflectance or brightness-temperature samples as read from the sensor file
pub type ChannelImage = Array2<f32>;

/// Normalized [0, 1] RGB composite (rows x cols x 3)
pub type CompositeImage = Array3<f32>;

/// 8-bit RGBA raster (rows x cols x 4)
pub type RgbaImage = Array3<u8>;

/// One object in the input bucket, the unit of work for both coordinators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub bucket: String,
    pub key: String,
    /// Source-side last-modified stamp, when the delivery path knows it
    pub last_modified: Option<DateTime<Utc>>,
}

impl SourceRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, stamp: DateTime<Utc>) -> Self {
        self.last_modified = Some(stamp);
        self
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Geographic bounding box, always held as sorted min/max pairs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl GeoBox {
    /// Build from two opposite corners given as (lon, lat) in any order
    pub fn from_corners(a: (f64, f64), b: (f64, f64)) -> Self {
        Self {
            min_lon: a.0.min(b.0),
            max_lon: a.0.max(b.0),
            min_lat: a.1.min(b.1),
            max_lat: a.1.max(b.1),
        }
    }

    /// The four corners as (lon, lat)
    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_lon, self.min_lat),
            (self.min_lon, self.max_lat),
            (self.max_lon, self.min_lat),
            (self.max_lon, self.max_lat),
        ]
    }
}

/// Satellite vantage point, selects the subset preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vantage {
    East,
    West,
}

impl Vantage {
    /// GOES-17 and GOES-18 buckets observe from the western slot
    pub fn for_bucket(bucket: &str) -> Self {
        if bucket.contains("goes17") || bucket.contains("goes18") {
            Vantage::West
        } else {
            Vantage::East
        }
    }
}

impl std::fmt::Display for Vantage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vantage::East => write!(f, "east"),
            Vantage::West => write!(f, "west"),
        }
    }
}

/// Native-grid subset box plus the visible extent of the output map
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionOfInterest {
    pub subset: GeoBox,
    pub map_extent: GeoBox,
}

/// Geostationary scan sweep axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepAxis {
    X,
    Y,
}

/// Native fixed-grid projection of a geostationary imager
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeosProjection {
    pub semi_major_axis: f64,
    pub semi_minor_axis: f64,
    pub inverse_flattening: f64,
    /// Sub-satellite longitude in degrees
    pub longitude_of_origin: f64,
    /// Height above the ellipsoid in meters
    pub perspective_height: f64,
    pub sweep: SweepAxis,
}

/// Channels required for the GeoColor composite
#[derive(Debug, Clone)]
pub struct ChannelSet {
    /// C01, 0.47 um
    pub blue: ChannelImage,
    /// C02, 0.64 um
    pub red: ChannelImage,
    /// C03, 0.86 um
    pub nir: ChannelImage,
    /// C13, 10.3 um brightness temperature (K)
    pub clean_ir: ChannelImage,
    /// Declared valid range of the C13 brightness temperature
    pub ir_valid_range: (f32, f32),
}

impl ChannelSet {
    /// Shape shared by all channels (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.red.dim()
    }
}

/// One decoded sensor file restricted to the region of interest
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub platform: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub projection: GeosProjection,
    /// Native x coordinates of the retained columns, meters
    pub x: Array1<f64>,
    /// Native y coordinates of the retained rows, meters
    pub y: Array1<f64>,
    pub channels: ChannelSet,
}

/// Final artifact handed to the publisher
#[derive(Debug, Clone)]
pub struct PublishedImage {
    pub filename: String,
    pub pixels: RgbaImage,
    /// Source-side last-modified stamp embedded as provenance
    pub provenance: Option<DateTime<Utc>>,
}

/// Error types for the ingestion pipeline
#[derive(Debug, thiserror::Error)]
pub enum GvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Object not yet available: {0}")]
    NotYetAvailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl GvError {
    /// Whether a later redelivery of the same unit may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GvError::Io(_) | GvError::NotYetAvailable(_) | GvError::Transport(_) | GvError::Queue(_)
        )
    }
}

impl From<reqwest::Error> for GvError {
    fn from(e: reqwest::Error) -> Self {
        GvError::Transport(e.to_string())
    }
}

impl From<png::EncodingError> for GvError {
    fn from(e: png::EncodingError) -> Self {
        GvError::Encode(e.to_string())
    }
}

/// Result type for pipeline operations
pub type GvResult<T> = Result<T, GvError>;
