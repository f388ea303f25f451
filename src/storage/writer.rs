//! Per-stripe FITS persistence.
//!
//! A save request writes one file per enabled stripe, each from its own thread:
//!
//! ```text
//! save(base) ──┬── reb-fits-0a: lock, de-interleave stripe A, unlock, encode, write
//!              ├── reb-fits-0b: ...
//!              └── reb-fits-0c: ...
//!              join all ──► SaveReport
//! ```
//!
//! Each worker holds the store lock only while copying its stripe out, so an
//! acquisition pass cannot rewrite a buffer mid-read. Encoding and file I/O happen
//! after the lock is released.
//!
//! Files are written as `<path>.part` and renamed into place once complete.
//!
//! # Channel geometry
//!
//! Each channel becomes one image extension. The sensor is read out by two rows of
//! amplifiers facing each other; channel `c` with `k = c % (channels / 2)` covers:
//!
//! | half   | DETSEC (x)                      | DETSEC (y)  | flipped |
//! |--------|---------------------------------|-------------|---------|
//! | first  | `W*(k+1) : W*k+1`               | `1 : H`     | x       |
//! | second | `W*(half-k-1)+1 : W*(half-k)`   | `2H : H+1`  | y       |

use crate::config::StorageConfig;
use crate::error::{AppResult, RebError};
use crate::storage::fits::{Card, FitsEncoder, Header, HeaderValue};
use crate::store::StripeStore;
use crate::stripe::{FrameTags, Geometry, Stripe, StripeId};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{error, info, warn};

/// Placement of one amplifier's image on the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmplifierSection {
    /// Detector x range, first to last pixel of the image row
    pub x: (i64, i64),
    /// Detector y range, first to last image row
    pub y: (i64, i64),
    /// Detector transformation vector
    pub dtv: (i64, i64),
    /// Diagonal of the detector transformation matrix
    pub dtm: (i64, i64),
}

impl AmplifierSection {
    /// Section covered by `channel` of a `width x height` per-channel image.
    pub fn for_channel(channel: u32, channels: u32, width: u32, height: u32) -> Self {
        let half = (channels / 2).max(1);
        let k = channel % half;
        // u32 products overflow for large geometries
        let (w, h) = (i64::from(width), i64::from(height));
        let (k, half) = (i64::from(k), i64::from(half));

        if i64::from(channel) < half {
            Self {
                x: (w * (k + 1), w * k + 1),
                y: (1, h),
                dtv: (w * (k + 1) + 1, 0),
                dtm: (-1, 1),
            }
        } else {
            Self {
                x: (w * (half - k - 1) + 1, w * (half - k)),
                y: (h * 2, h + 1),
                dtv: (w * (half - k - 1), 2 * h + 1),
                dtm: (1, -1),
            }
        }
    }

    /// `DETSEC` value.
    pub fn detsec(&self) -> String {
        section(self.x, self.y)
    }

    /// Detector position of the 1-based image pixel `(x, y)`.
    pub fn to_detector(&self, x: u32, y: u32) -> (i64, i64) {
        (
            self.dtv.0 + self.dtm.0 * i64::from(x),
            self.dtv.1 + self.dtm.1 * i64::from(y),
        )
    }
}

/// Size of the assembled detector, `[1:W*half,1:2H]`.
fn detector_size(geometry: Geometry) -> String {
    let half = i64::from(geometry.channels / 2);
    section(
        (1, i64::from(geometry.width) * half),
        (1, i64::from(geometry.height) * 2),
    )
}

fn section(x: (i64, i64), y: (i64, i64)) -> String {
    format!("[{}:{},{}:{}]", x.0, x.1, y.0, y.1)
}

/// Extract one channel from interleaved samples into a row-major `width x height` grid.
///
/// Sample `idx` with `idx % channels == channel` is pixel `p = idx / channels`, placed
/// at column `p % width`, row `p / width`. Pixels missing from a short buffer stay zero.
pub fn deinterleave(samples: &[u32], channel: u32, geometry: Geometry) -> Vec<u32> {
    let pixels = geometry.pixels_per_channel();
    let mut grid = vec![0u32; pixels];
    let step = geometry.channels as usize;
    for (pixel, sample) in samples
        .iter()
        .skip(channel as usize)
        .step_by(step)
        .take(pixels)
        .enumerate()
    {
        grid[pixel] = *sample;
    }
    grid
}

/// A stripe copied out of the store, one grid per channel.
#[derive(Debug, Clone)]
pub struct StripeImage {
    /// Stripe position
    pub id: StripeId,
    /// Per-channel geometry
    pub geometry: Geometry,
    /// Correlation ids of the frame
    pub tags: FrameTags,
    /// Samples the acquisition pass actually wrote
    pub samples_written: usize,
    /// Row-major image per channel
    pub channels: Vec<Vec<u32>>,
}

impl StripeImage {
    /// De-interleave every channel of `stripe`.
    pub fn capture(stripe: &Stripe) -> Self {
        let geometry = stripe.geometry();
        let samples = stripe.samples();
        Self {
            id: stripe.id(),
            geometry,
            tags: stripe.tags(),
            samples_written: samples.len(),
            channels: (0..geometry.channels)
                .map(|c| deinterleave(samples, c, geometry))
                .collect(),
        }
    }

    /// Whether every pixel of every channel was written.
    pub fn is_complete(&self) -> bool {
        self.samples_written == self.geometry.samples_per_stripe()
    }
}

/// Outcome of writing one stripe.
#[derive(Debug)]
pub struct StripeSaveResult {
    /// Stripe written
    pub stripe: StripeId,
    /// Final file path
    pub path: PathBuf,
    /// Bytes written, or why not
    pub result: AppResult<usize>,
}

/// Results of one save request, in stripe order.
#[derive(Debug, Default)]
pub struct SaveReport {
    /// One entry per enabled stripe
    pub results: Vec<StripeSaveResult>,
}

impl SaveReport {
    /// Whether every file was written.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.result.is_ok())
    }

    /// Paths of the files that were written.
    pub fn written(&self) -> impl Iterator<Item = &Path> {
        self.results
            .iter()
            .filter(|r| r.result.is_ok())
            .map(|r| r.path.as_path())
    }

    /// Stripes that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (StripeId, &RebError)> {
        self.results
            .iter()
            .filter_map(|r| r.result.as_ref().err().map(|e| (r.stripe, e)))
    }
}

/// Writes the enabled stripes of a store as FITS files.
#[derive(Debug, Clone)]
pub struct FitsWriter {
    reb_id: u32,
    extension: String,
    keywords: Header,
}

impl FitsWriter {
    /// Writer for board `reb_id` producing `.<extension>` files.
    pub fn new(reb_id: u32, extension: &str) -> Self {
        Self {
            reb_id,
            extension: extension.to_string(),
            keywords: Header::new(),
        }
    }

    /// Writer using the storage section of the configuration.
    pub fn from_config(reb_id: u32, config: &StorageConfig) -> AppResult<Self> {
        config
            .header_keywords
            .iter()
            .try_fold(Self::new(reb_id, &config.format_extension), |writer, (k, v)| {
                writer.with_keyword(k, v, "")
            })
    }

    /// Add a keyword to the primary header of every file.
    ///
    /// Keywords the writer sets itself are refused, as are cards that do not fit.
    pub fn with_keyword(mut self, keyword: &str, value: &str, comment: &str) -> AppResult<Self> {
        check_extra_keyword(keyword, value)?;
        self.keywords.set(keyword, value, comment);
        Ok(self)
    }

    /// `<base>.<reb_id><letter>.<extension>`
    pub fn output_path(&self, base: &Path, stripe: StripeId) -> PathBuf {
        let mut name = OsString::from(base.as_os_str());
        name.push(format!(
            ".{}{}.{}",
            self.reb_id,
            stripe.file_letter(),
            self.extension
        ));
        PathBuf::from(name)
    }

    /// Write every enabled stripe concurrently and wait for all of them.
    ///
    /// Per-file failures are collected in the report. A thread that cannot be
    /// spawned fails the whole request once the already running writers finished.
    pub fn save(&self, store: &StripeStore, base: &Path) -> AppResult<SaveReport> {
        let enabled: Vec<StripeId> = store.with_lock(|state| state.enabled().map(Stripe::id).collect());
        let mut spawn_error = None;

        let results = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(enabled.len());
            for id in enabled {
                let path = self.output_path(base, id);
                let name = format!("reb-fits-{}{}", self.reb_id, id.file_letter());
                let worker_path = path.clone();
                let spawned = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(scope, move || self.write_stripe(store, id, &worker_path));
                match spawned {
                    Ok(handle) => handles.push((id, path, handle)),
                    Err(source) => {
                        error!(thread = %name, error = %source, "Failed to spawn FITS writer");
                        spawn_error = Some(RebError::ThreadSpawn { name, source });
                        break;
                    }
                }
            }

            handles
                .into_iter()
                .map(|(stripe, path, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(RebError::Persistence {
                            path: path.display().to_string(),
                            message: "writer thread panicked".to_string(),
                        })
                    });
                    StripeSaveResult {
                        stripe,
                        path,
                        result,
                    }
                })
                .collect::<Vec<_>>()
        });

        if let Some(err) = spawn_error {
            return Err(err);
        }

        let report = SaveReport { results };
        for (stripe, err) in report.failures() {
            error!(stripe = %stripe, error = %err, "FITS write failed");
        }
        Ok(report)
    }

    /// Copy one stripe out under the lock, then encode and write it.
    fn write_stripe(&self, store: &StripeStore, id: StripeId, path: &Path) -> AppResult<usize> {
        let image = store
            .with_lock(|state| {
                let stripe = state.stripe(id);
                stripe.is_enabled().then(|| StripeImage::capture(stripe))
            })
            .ok_or_else(|| RebError::Persistence {
                path: path.display().to_string(),
                message: format!("stripe {} was disabled before it could be saved", id),
            })?;

        if !image.is_complete() {
            warn!(
                stripe = %id,
                written = image.samples_written,
                expected = image.geometry.samples_per_stripe(),
                "Saving incomplete stripe, missing pixels are zero"
            );
        }

        let bytes = self.encode(&image)?;
        write_atomically(path, &bytes)?;
        info!(path = %path.display(), stripe = %id, bytes = bytes.len(), "FITS file written");
        Ok(bytes.len())
    }

    /// Encode a captured stripe as a complete FITS file.
    pub fn encode(&self, image: &StripeImage) -> AppResult<bytes::Bytes> {
        let Geometry {
            height,
            width,
            channels,
        } = image.geometry;
        let detsize = detector_size(image.geometry);
        let datasec = section((1, i64::from(width)), (1, i64::from(height)));

        let mut primary = Header::new();
        primary
            .set("NEXTS", channels, "Number of extension images in file")
            .set("DETSIZE", detsize.as_str(), "Detector Size")
            .set("REBID", self.reb_id, "Readout board id")
            .set("STRIPE", image.id.to_string(), "Stripe letter")
            .set("TAG", format!("{:016x}", image.tags.tag), "Acquisition tag")
            .set("CLUSTER", image.tags.cluster, "Cluster id")
            .set("ADDRESS", image.tags.address, "Board address")
            .set(
                "DATE",
                chrono::Utc::now()
                    .format("%Y-%m-%dT%H:%M:%S%.3f")
                    .to_string(),
                "File creation date (UTC)",
            );
        primary.extend_new(&self.keywords)?;

        let mut encoder = FitsEncoder::new(&primary)?;
        for (channel, pixels) in (0u32..).zip(&image.channels) {
            let amp = AmplifierSection::for_channel(channel, channels, width, height);
            let mut ext = Header::new();
            ext.set("EXTNAME", format!("CHAN_{}", channel), "Amplifier image")
                .set("CHANNEL", channel, "Amplifier channel")
                .set("DETSIZE", detsize.as_str(), "Detector Size")
                .set("DATASEC", datasec.as_str(), "Data section")
                .set("DETSEC", amp.detsec(), "Section of detector")
                .set("TRIMSEC", datasec.as_str(), "Trimmed section")
                .set("DTV1", amp.dtv.0, "detector transformation vector")
                .set("DTV2", amp.dtv.1, "detector transformation vector")
                .set("DTM1_1", amp.dtm.0, "detector transformation matrix")
                .set("DTM2_2", amp.dtm.1, "detector transformation matrix");
            encoder.add_image(width, height, pixels, &ext)?;
        }
        Ok(encoder.finish())
    }
}

/// Keywords written by the encoder or the writer on every file.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "EXTEND", "XTENSION", "PCOUNT",
    "GCOUNT", "END", "NEXTS", "DETSIZE", "REBID", "STRIPE", "TAG", "CLUSTER", "ADDRESS",
    "DATE", "EXTNAME", "CHANNEL", "DATASEC", "DETSEC", "TRIMSEC", "DTV1", "DTV2",
    "DTM1_1", "DTM2_2",
];

/// Check that `keyword = 'value'` can be added to every file without clobbering a
/// card the writer owns.
pub fn check_extra_keyword(keyword: &str, value: &str) -> AppResult<()> {
    if RESERVED_KEYWORDS.contains(&keyword) {
        return Err(RebError::Persistence {
            path: keyword.to_string(),
            message: "keyword is reserved by the FITS writer".to_string(),
        });
    }
    Card {
        keyword: keyword.to_string(),
        value: HeaderValue::from(value),
        comment: String::new(),
    }
    .encode()
    .map(|_| ())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let mut partial = OsString::from(path.as_os_str());
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let persist = || -> std::io::Result<()> {
        std::fs::write(&partial, bytes)?;
        std::fs::rename(&partial, path)
    };
    persist().map_err(|e| {
        let _ = std::fs::remove_file(&partial);
        RebError::Persistence {
            path: path.display().to_string(),
            message: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fits::read_hdus;
    use crate::stripe::StripeMask;

    #[test]
    fn deinterleave_recovers_raster_order() {
        let geometry = Geometry::new(2, 3, 2).unwrap();
        // channel 0 holds even values, channel 1 odd ones
        let samples: Vec<u32> = (0..12).collect();
        assert_eq!(deinterleave(&samples, 0, geometry), vec![0, 2, 4, 6, 8, 10]);
        assert_eq!(deinterleave(&samples, 1, geometry), vec![1, 3, 5, 7, 9, 11]);
    }

    #[test]
    fn deinterleave_short_buffer_pads_zero() {
        let geometry = Geometry::new(1, 3, 2).unwrap();
        assert_eq!(deinterleave(&[5, 6, 7], 0, geometry), vec![5, 7, 0]);
        assert_eq!(deinterleave(&[5, 6, 7], 1, geometry), vec![6, 0, 0]);
    }

    #[test]
    fn amplifier_sections_tile_the_detector() {
        let (channels, width, height) = (16, 4, 3);
        let mut covered = std::collections::HashSet::new();
        for c in 0..channels {
            let amp = AmplifierSection::for_channel(c, channels, width, height);
            for y in 1..=height {
                for x in 1..=width {
                    let (dx, dy) = amp.to_detector(x, y);
                    assert!(dx >= 1 && dx <= i64::from(width * channels / 2));
                    assert!(dy >= 1 && dy <= i64::from(height * 2));
                    assert!(covered.insert((dx, dy)), "channel {} overlaps at {:?}", c, (dx, dy));
                }
            }
            // DETSEC endpoints agree with the transform
            assert_eq!(amp.to_detector(1, 1), (amp.x.0, amp.y.0));
            assert_eq!(amp.to_detector(width, height), (amp.x.1, amp.y.1));
        }
        assert_eq!(covered.len(), (width * height * channels) as usize);
    }

    #[test]
    fn detsec_for_first_and_last_channel() {
        let first = AmplifierSection::for_channel(0, 16, 512, 2002);
        assert_eq!(first.detsec(), "[512:1,1:2002]");
        let last = AmplifierSection::for_channel(15, 16, 512, 2002);
        assert_eq!(last.detsec(), "[1:512,4004:2003]");
    }

    #[test]
    fn large_geometry_sections_do_not_wrap() {
        let (width, height) = (u32::MAX, u32::MAX);
        let w = i64::from(width);

        let last = AmplifierSection::for_channel(15, 16, width, height);
        assert_eq!(last.detsec(), "[1:4294967295,8589934590:4294967296]");
        let middle = AmplifierSection::for_channel(7, 16, width, height);
        assert_eq!(middle.x, (w * 8, w * 7 + 1));

        let geometry = Geometry {
            height,
            width,
            channels: 16,
        };
        assert_eq!(
            detector_size(geometry),
            format!("[1:{},1:{}]", w * 8, i64::from(height) * 2)
        );
    }

    #[test]
    fn writer_keywords_cannot_replace_its_own_cards() {
        for keyword in ["NEXTS", "BITPIX", "DETSIZE", "STRIPE"] {
            assert!(FitsWriter::new(0, "fits")
                .with_keyword(keyword, "99", "")
                .is_err());
        }
        let too_long = "X".repeat(69);
        assert!(FitsWriter::new(0, "fits")
            .with_keyword("OBSERVER", &too_long, "")
            .is_err());

        let mut storage = StorageConfig::default();
        storage
            .header_keywords
            .insert("TAG".to_string(), "0".to_string());
        assert!(FitsWriter::from_config(0, &storage).is_err());

        storage.header_keywords.clear();
        storage
            .header_keywords
            .insert("INSTRUME".to_string(), "REB".to_string());
        assert!(FitsWriter::from_config(0, &storage).is_ok());
    }

    #[test]
    fn output_path_injects_board_and_stripe() {
        let writer = FitsWriter::new(2, "fits");
        let path = writer.output_path(Path::new("/data/run.7"), StripeId::Middle);
        assert_eq!(path, PathBuf::from("/data/run.7.2b.fits"));
    }

    #[test]
    fn save_writes_one_file_per_enabled_stripe() {
        let dir = tempfile::tempdir().unwrap();
        let store = StripeStore::new();
        store
            .configure(2, 2, 2, StripeMask::LEFT | StripeMask::RIGHT)
            .unwrap();
        store.with_lock(|state| {
            for v in 0..8 {
                state.stripe_mut(StripeId::Left).push(v);
                state.stripe_mut(StripeId::Right).push(v + 100);
            }
        });

        let writer = FitsWriter::new(0, "fits")
            .with_keyword("OBSERVER", "lab", "")
            .unwrap();
        let report = writer.save(&store, &dir.path().join("img")).unwrap();

        assert!(report.is_success());
        let names: Vec<String> = report
            .written()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["img.0a.fits", "img.0c.fits"]);
        assert!(!dir.path().join("img.0b.fits").exists());

        let bytes = std::fs::read(dir.path().join("img.0c.fits")).unwrap();
        let hdus = read_hdus(&bytes).unwrap();
        assert_eq!(hdus.len(), 3);
        assert_eq!(hdus[0].header.integer("NEXTS"), Some(2));
        assert_eq!(hdus[0].header.text("STRIPE"), Some("C"));
        assert_eq!(hdus[0].header.text("OBSERVER"), Some("lab"));
        assert_eq!(hdus[1].data, vec![100, 102, 104, 106]);
        assert_eq!(hdus[2].data, vec![101, 103, 105, 107]);
        assert_eq!(hdus[2].header.text("DETSEC"), Some("[1:2,4:3]"));
    }

    #[test]
    fn failing_directory_is_reported_per_stripe() {
        let dir = tempfile::tempdir().unwrap();
        let store = StripeStore::new();
        store.configure(1, 1, 2, StripeMask::MIDDLE).unwrap();

        let base = dir.path().join("missing").join("img");
        let report = FitsWriter::new(1, "fits").save(&store, &base).unwrap();

        assert!(!report.is_success());
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, StripeId::Middle);
        assert!(matches!(failures[0].1, RebError::Persistence { .. }));
    }

    #[test]
    fn save_with_nothing_enabled_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report = FitsWriter::new(0, "fits")
            .save(&StripeStore::new(), &dir.path().join("img"))
            .unwrap();
        assert!(report.results.is_empty());
    }
}
