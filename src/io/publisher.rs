use crate::types::{GvError, GvResult, PublishedImage, RgbaImage};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// tEXt keyword carrying the source-side last-modified stamp
pub const PROVENANCE_KEY: &str = "last_modified";

const FILENAME_STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// `{platform}_{timestamp}.png`
pub fn image_filename(platform: &str, stamp: DateTime<Utc>) -> String {
    format!("{}_{}.png", platform, stamp.format(FILENAME_STAMP_FORMAT))
}

/// Derive the output filename from an ABI object key.
///
/// The timestamp is the midpoint of the scan start and end, to the second.
pub fn filename_for_key(key: &str) -> GvResult<String> {
    let pattern = Regex::new(r"(?:^|[_/])([^_/]+)_s(\d{13})\d_e(\d{13})\d_c\d+")
        .map_err(|e| GvError::Processing(e.to_string()))?;
    let caps = pattern
        .captures(key)
        .ok_or_else(|| GvError::MalformedInput(format!("Unrecognized ABI key: {}", key)))?;

    let scan_time = |s: &str| {
        NaiveDateTime::parse_from_str(s, "%Y%j%H%M%S")
            .map(|t| Utc.from_utc_datetime(&t))
            .map_err(|e| GvError::MalformedInput(format!("Bad scan time '{}' in {}: {}", s, key, e)))
    };
    let start = scan_time(&caps[2])?;
    let end = scan_time(&caps[3])?;
    let midpoint = start + chrono::Duration::seconds((end - start).num_seconds() / 2);

    Ok(image_filename(&caps[1], midpoint))
}

/// Timestamp embedded after the last `_` of a published filename
pub fn parse_filename_stamp(filename: &str) -> Option<DateTime<Utc>> {
    let stem = filename.strip_suffix(".png")?;
    let (_, stamp) = stem.rsplit_once('_')?;
    NaiveDateTime::parse_from_str(stamp, FILENAME_STAMP_FORMAT)
        .ok()
        .map(|t| Utc.from_utc_datetime(&t))
}

/// Provenance stamp embedded in an existing output
pub fn read_provenance<P: AsRef<Path>>(path: P) -> GvResult<Option<DateTime<Utc>>> {
    let path = path.as_ref();
    let decoder = png::Decoder::new(File::open(path)?);
    let reader = decoder
        .read_info()
        .map_err(|e| GvError::MalformedInput(format!("{}: {}", path.display(), e)))?;

    let stamp = reader
        .info()
        .uncompressed_latin1_text
        .iter()
        .find(|chunk| chunk.keyword == PROVENANCE_KEY)
        .and_then(|chunk| DateTime::parse_from_rfc3339(chunk.text.trim()).ok())
        .map(|t| t.with_timezone(&Utc));
    Ok(stamp)
}

/// Encode RGBA8 with an optional provenance text chunk
pub fn encode_png<W: Write>(
    writer: W,
    pixels: &RgbaImage,
    provenance: Option<DateTime<Utc>>,
) -> GvResult<()> {
    let (height, width, bands) = pixels.dim();
    if bands != 4 {
        return Err(GvError::Encode(format!("Expected 4 bands, got {}", bands)));
    }

    let mut encoder = png::Encoder::new(writer, width as u32, height as u32);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    if let Some(stamp) = provenance {
        encoder.add_text_chunk(
            PROVENANCE_KEY.to_string(),
            stamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        )?;
    }

    let data: Vec<u8> = pixels.iter().copied().collect();
    let mut png_writer = encoder.write_header()?;
    png_writer.write_image_data(&data)?;
    png_writer.finish()?;
    Ok(())
}

/// Bounded map from provenance stamp to published filename, newest kept
#[derive(Debug, Clone)]
pub struct RecencyIndex {
    capacity: usize,
    entries: BTreeMap<DateTime<Utc>, String>,
}

impl RecencyIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: BTreeMap::new(),
        }
    }

    pub fn contains(&self, stamp: &DateTime<Utc>) -> bool {
        self.entries.contains_key(stamp)
    }

    /// Record a stamp, evicting the oldest entries beyond capacity
    pub fn insert(&mut self, stamp: DateTime<Utc>, filename: String) {
        self.entries.insert(stamp, filename);
        while self.entries.len() > self.capacity {
            self.entries.pop_first();
        }
    }

    pub fn forget(&mut self, filename: &str) {
        self.entries.retain(|_, name| name != filename);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Written(PathBuf),
    /// An output with this filename already exists and was left untouched
    AlreadyPublished(PathBuf),
    /// An output carrying the same provenance stamp already exists
    DuplicateProvenance(String),
}

/// Write-once image store over one output directory
pub struct Publisher {
    output_dir: PathBuf,
    index: Mutex<RecencyIndex>,
}

impl Publisher {
    /// Open the output directory and seed the recency index from the newest outputs
    pub fn new<P: AsRef<Path>>(output_dir: P, max_images: usize) -> GvResult<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;

        let mut published: Vec<(DateTime<Utc>, String)> = std::fs::read_dir(&output_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| parse_filename_stamp(&name).map(|stamp| (stamp, name)))
            .collect();
        published.sort();

        let mut index = RecencyIndex::new(max_images);
        for (_, name) in published.iter().rev().take(max_images) {
            match read_provenance(output_dir.join(name)) {
                Ok(Some(stamp)) => index.insert(stamp, name.clone()),
                Ok(None) => log::debug!("{} carries no provenance", name),
                Err(e) => log::warn!("Could not read provenance of {}: {}", name, e),
            }
        }
        log::info!(
            "Publishing to {} ({} recent outputs indexed)",
            output_dir.display(),
            index.len()
        );

        Ok(Self {
            output_dir,
            index: Mutex::new(index),
        })
    }

    pub fn final_path(&self, filename: &str) -> PathBuf {
        self.output_dir.join(filename)
    }

    /// Filename-derived duplicate check
    pub fn is_published(&self, filename: &str) -> bool {
        self.final_path(filename).exists()
    }

    /// Provenance-derived duplicate check against the recency index
    pub fn has_provenance(&self, stamp: &DateTime<Utc>) -> GvResult<bool> {
        Ok(self.lock_index()?.contains(stamp))
    }

    /// Publish an image unless either duplicate check already covers it
    pub fn publish(&self, image: &PublishedImage) -> GvResult<PublishOutcome> {
        if self.is_published(&image.filename) {
            log::info!("File already exists at {}", self.final_path(&image.filename).display());
            return Ok(PublishOutcome::AlreadyPublished(self.final_path(&image.filename)));
        }
        if let Some(stamp) = image.provenance {
            if self.has_provenance(&stamp)? {
                log::info!("Source stamp {} already published, skipping {}", stamp, image.filename);
                return Ok(PublishOutcome::DuplicateProvenance(image.filename.clone()));
            }
        }

        let outcome = self.write_atomic(&image.filename, |file| {
            encode_png(file, &image.pixels, image.provenance)
        })?;

        if let PublishOutcome::Written(path) = &outcome {
            log::info!("Saved image to {}", path.display());
            if let Some(stamp) = image.provenance {
                self.lock_index()?.insert(stamp, image.filename.clone());
            }
        }
        Ok(outcome)
    }

    /// Write through a temporary file in the output directory, then rename
    /// into place without clobbering. The temporary file is removed whenever
    /// `encode` fails.
    pub fn write_atomic<F>(&self, filename: &str, encode: F) -> GvResult<PublishOutcome>
    where
        F: FnOnce(&mut BufWriter<&mut File>) -> GvResult<()>,
    {
        let final_path = self.final_path(filename);
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .suffix(".png")
            .tempfile_in(&self.output_dir)?;

        {
            let mut buffered = BufWriter::new(tmp.as_file_mut());
            encode(&mut buffered)?;
            buffered.flush()?;
        }
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }

        match tmp.persist_noclobber(&final_path) {
            Ok(_) => Ok(PublishOutcome::Written(final_path)),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                log::info!("{} appeared while encoding, keeping existing file", final_path.display());
                Ok(PublishOutcome::AlreadyPublished(final_path))
            }
            Err(e) => Err(GvError::Io(e.error)),
        }
    }

    /// Drop deleted outputs from the recency index
    pub fn forget<'a, I>(&self, filenames: I) -> GvResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut index = self.lock_index()?;
        for name in filenames {
            index.forget(name);
        }
        Ok(())
    }

    fn lock_index(&self) -> GvResult<MutexGuard<'_, RecencyIndex>> {
        self.index
            .lock()
            .map_err(|_| GvError::Processing("Recency index lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    const KEY: &str = "ABI-L2-MCMIPC/2022/301/18/OR_ABI-L2-MCMIPC-M6_G16_s20223011801173_e20223011803546_c20223011804089.nc";

    #[test]
    fn test_filename_for_key_uses_midpoint() {
        // 18:01:17 .. 18:03:54 -> midpoint 18:02:35 (157 s / 2 truncated)
        assert_eq!(filename_for_key(KEY).unwrap(), "G16_2022-10-28T18:02:35Z.png");
        assert_eq!(
            filename_for_key("OR_ABI-L2-MCMIPC-M6_G17_s20230010000000_e20230010002000_c20230010002300.nc").unwrap(),
            "G17_2023-01-01T00:01:00Z.png"
        );
        assert!(matches!(filename_for_key("README.txt"), Err(GvError::MalformedInput(_))));
    }

    #[test]
    fn test_parse_filename_stamp() {
        let stamp = parse_filename_stamp("G16_2022-10-28T18:02:35Z.png").unwrap();
        assert_eq!(stamp, Utc.with_ymd_and_hms(2022, 10, 28, 18, 2, 35).unwrap());
        assert_eq!(image_filename("G16", stamp), "G16_2022-10-28T18:02:35Z.png");
        assert!(parse_filename_stamp("metadata.json").is_none());
        assert!(parse_filename_stamp("G16_latest.png").is_none());
    }

    #[test]
    fn test_recency_index_is_bounded() {
        let mut index = RecencyIndex::new(2);
        let t = |m| Utc.with_ymd_and_hms(2022, 10, 28, 18, m, 0).unwrap();
        index.insert(t(1), "a.png".into());
        index.insert(t(2), "b.png".into());
        index.insert(t(3), "c.png".into());
        assert_eq!(index.len(), 2);
        assert!(!index.contains(&t(1)));
        assert!(index.contains(&t(3)));

        index.forget("c.png");
        assert!(!index.contains(&t(3)));
    }

    #[test]
    fn test_provenance_embedded_and_reseeded() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = Utc.with_ymd_and_hms(2022, 10, 28, 18, 4, 31).unwrap();
        let image = PublishedImage {
            filename: "G16_2022-10-28T18:02:35Z.png".to_string(),
            pixels: Array3::from_elem((3, 4, 4), 200u8),
            provenance: Some(stamp),
        };

        let publisher = Publisher::new(dir.path(), 48).unwrap();
        let outcome = publisher.publish(&image).unwrap();
        let path = dir.path().join(&image.filename);
        assert_eq!(outcome, PublishOutcome::Written(path.clone()));
        assert_eq!(read_provenance(&path).unwrap(), Some(stamp));

        // A fresh publisher finds the stamp without re-reading the whole archive
        let reopened = Publisher::new(dir.path(), 48).unwrap();
        assert!(reopened.has_provenance(&stamp).unwrap());
        let renamed = PublishedImage {
            filename: "G16_2022-10-28T18:02:36Z.png".to_string(),
            ..image
        };
        assert_eq!(
            reopened.publish(&renamed).unwrap(),
            PublishOutcome::DuplicateProvenance(renamed.filename.clone())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_output_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let publisher = Publisher::new(dir.path(), 4).unwrap();
        let image = PublishedImage {
            filename: "G16_2022-10-28T18:02:35Z.png".to_string(),
            pixels: Array3::zeros((2, 2, 4)),
            provenance: None,
        };
        publisher.publish(&image).unwrap();
        let mode = std::fs::metadata(dir.path().join(&image.filename))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
