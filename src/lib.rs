//! goes_viewer: continuous GOES-R GeoColor compositing
//!
//! Ingests ABI multi-band files as they land in a bucket, builds a GeoColor
//! composite, reprojects it onto a fixed Web Mercator grid and publishes each
//! acquisition exactly once as a PNG for the web dashboard.

pub mod types;
pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;
pub mod delivery;

// Re-export main types and functions for easier access
pub use types::{
    ChannelSet, CompositeImage, GeoBox, GeosProjection, GvError, GvResult, PublishedImage,
    RegionOfInterest, RgbaImage, SourceRef, SourceUnit, SweepAxis, Vantage,
};

pub use config::{Config, Mode};
pub use delivery::{Outcome, Poller, QueueConsumer, UnitProcessor};
pub use io::{GoesReader, HttpObjectStore, Publisher, RetentionSweeper, SqsQueue};
pub use pipeline::Pipeline;
