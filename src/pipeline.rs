//! Fetch, decode, colorize, reproject, enhance and publish one object

use crate::config::Config;
use crate::core::colorize::{ColorizeParams, GeoColorProcessor};
use crate::core::enhance::ImageEnhancer;
use crate::core::reproject::{resample, TargetGrid, WeightCache};
use crate::delivery::{Outcome, UnitProcessor};
use crate::io::goes_reader::GoesReader;
use crate::io::object_store::ObjectStore;
use crate::io::publisher::{filename_for_key, PublishOutcome, Publisher};
use crate::io::retention::{RetentionSweeper, SweepReport};
use crate::types::{GvResult, PublishedImage, SourceRef, Vantage};
use chrono::{DateTime, Utc};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

pub struct Pipeline {
    config: Config,
    store: Arc<dyn ObjectStore>,
    colorizer: GeoColorProcessor,
    enhancer: ImageEnhancer,
    weights: WeightCache,
    publisher: Publisher,
    sweeper: RetentionSweeper,
}

impl Pipeline {
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>) -> GvResult<Self> {
        Ok(Self {
            colorizer: GeoColorProcessor::new(ColorizeParams {
                contrast: config.contrast,
            }),
            enhancer: ImageEnhancer::new(config.enhance.clone())?,
            weights: WeightCache::new(),
            publisher: Publisher::new(&config.output_dir, config.max_images)?,
            sweeper: RetentionSweeper::new(&config.output_dir, config.retention),
            config: config.clone(),
            store,
        })
    }

    /// Number of distinct grid geometries seen so far
    pub fn cached_geometries(&self) -> usize {
        self.weights.len()
    }
}

impl UnitProcessor for Pipeline {
    fn process(&self, unit: &SourceRef) -> GvResult<Outcome> {
        log::info!("Processing file from {}: {}", unit.bucket, unit.key);
        let started = Instant::now();

        let filename = filename_for_key(&unit.key)?;
        if self.publisher.is_published(&filename) {
            log::info!("File already exists at {}", self.publisher.final_path(&filename).display());
            return Ok(Outcome::AlreadyPublished(filename));
        }
        if let Some(stamp) = unit.last_modified {
            if self.publisher.has_provenance(&stamp)? {
                log::info!("Source stamp {} already published", stamp);
                return Ok(Outcome::AlreadyPublished(filename));
            }
        }

        let fetched = self.store.fetch(unit)?;
        let roi = self.config.region(Vantage::for_bucket(&unit.bucket));
        let decoded = GoesReader::decode(&mut Cursor::new(fetched.bytes), &roi)?;
        log::debug!(
            "Decoded {} scan {} - {}: {:?} native pixels",
            decoded.platform,
            decoded.start_time,
            decoded.end_time,
            decoded.channels.dim()
        );

        let composite = self.colorizer.colorize(&decoded.channels)?;
        let target = TargetGrid::from_extent(&roi.map_extent, self.config.grid_spacing, self.config.grid_spacing)?;
        let weights = self
            .weights
            .get_or_compute(&decoded, &target, self.config.search_radius)?;
        let rgba = resample(&weights, &composite)?;
        let pixels = self.enhancer.enhance(&rgba)?;

        // Fall back to the scan end so every output carries a stamp
        let provenance = unit
            .last_modified
            .or(fetched.last_modified)
            .unwrap_or(decoded.end_time);
        let outcome = self.publisher.publish(&PublishedImage {
            filename: filename.clone(),
            pixels,
            provenance: Some(provenance),
        })?;
        log::debug!("Pipeline for {} took {:.2?}", unit.key, started.elapsed());

        Ok(match outcome {
            PublishOutcome::Written(path) => Outcome::Published(path),
            PublishOutcome::AlreadyPublished(_) | PublishOutcome::DuplicateProvenance(_) => {
                Outcome::AlreadyPublished(filename)
            }
        })
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> GvResult<SweepReport> {
        let report = self.sweeper.sweep(now)?;
        self.publisher
            .forget(report.deleted.iter().map(String::as_str))?;
        Ok(report)
    }
}
