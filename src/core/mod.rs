//! Core raster processing modules

pub mod projection;
pub mod colorize;
pub mod reproject;
pub mod enhance;

// Re-export main types
pub use colorize::{ColorizeParams, GeoColorProcessor};
pub use reproject::{resample, ResampleWeights, TargetGrid, WeightCache, WeightComputer};
pub use enhance::{EnhanceParams, ImageEnhancer};
