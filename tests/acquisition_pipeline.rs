//! Integration tests for the acquisition and persistence path
//!
//! These tests drive a `RebDevice` (or the store, demultiplexer and writer directly)
//! with mock hardware and read the resulting FITS files back.

use reb_gige::config::RebConfig;
use reb_gige::demux::{Demultiplexer, SignTransform};
use reb_gige::hardware::{MockRegisterLink, MockTransport};
use reb_gige::storage::fits::read_hdus;
use reb_gige::storage::FitsWriter;
use reb_gige::store::StripeStore;
use reb_gige::stripe::{FrameTags, Geometry, StripeId, StripeMask};
use reb_gige::{RebDevice, RebError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn offline_device(channels: u32, transport: &MockTransport) -> RebDevice {
    let mut config = RebConfig::default();
    config.device.image_service = false;
    config.device.channels = channels;
    RebDevice::new(
        &config,
        Box::new(MockRegisterLink::with_stripes(0x7)),
        Some(Box::new(transport.clone())),
    )
    .unwrap()
}

/// Undo the mid-scale transform
fn code_of(sample: i32) -> u32 {
    ((sample as u32) ^ 0x1_FFFF) >> 2
}

// =============================================================================
// Demultiplexing
// =============================================================================

#[test]
fn test_left_right_frame_splits_evenly() {
    let transport = MockTransport::open(0, "eth0");
    let mut device = offline_device(2, &transport);

    let outcome = device
        .acquire(4, 4, StripeMask::LEFT | StripeMask::RIGHT, FrameTags::default())
        .unwrap();

    assert_eq!(outcome.expected, 64);
    assert_eq!(outcome.written, [32, 0, 32]);
    device.store().with_lock(|state| {
        assert_eq!(state.stripe(StripeId::Left).len(), 32);
        assert_eq!(state.stripe(StripeId::Middle).len(), 0);
        assert_eq!(state.stripe(StripeId::Right).len(), 32);
        assert!(state.frame_ready());
    });
}

#[test]
fn test_stripe_samples_keep_capture_order() {
    let transport = MockTransport::open(0, "eth0");
    let mut device = offline_device(4, &transport);

    device
        .acquire(2, 2, StripeMask::ALL_BITS, FrameTags::default())
        .unwrap();

    device.store().with_lock(|state| {
        for id in StripeId::ALL {
            let codes: Vec<u32> = state
                .stripe(id)
                .samples()
                .iter()
                .map(|s| code_of(*s as i32))
                .collect();
            // Stripe i gets groups i, i+3, i+6, ... of 4 consecutive words
            let expected: Vec<u32> = (0..48u32)
                .filter(|w| (w / 4) % 3 == id.index() as u32)
                .collect();
            assert_eq!(codes, expected, "stripe {}", id);
        }
    });
}

#[test]
fn test_short_transport_read_still_publishes() {
    let transport = MockTransport::open(0, "eth0");
    transport.shorten_by(10);
    let mut device = offline_device(2, &transport);

    let outcome = device
        .acquire(4, 4, StripeMask::LEFT, FrameTags::default())
        .unwrap();

    assert!(!outcome.is_complete());
    assert!(matches!(
        outcome.transport_error,
        Some(RebError::TransportMismatch { expected: 32, received: 22 })
    ));
    assert_eq!(outcome.written, [22, 0, 0]);
    assert!(device.store().snapshot_and_clear());
}

#[test]
fn test_overlong_announcement_never_overflows() {
    let transport = MockTransport::open(0, "eth0");
    transport.announce(Some(1_000));
    let mut device = offline_device(2, &transport);

    let outcome = device
        .acquire(2, 2, StripeMask::MIDDLE, FrameTags::default())
        .unwrap();

    assert!(matches!(
        outcome.transport_error,
        Some(RebError::TransportMismatch { expected: 8, received: 1_000 })
    ));
    device.store().with_lock(|state| {
        let middle = state.stripe(StripeId::Middle);
        assert_eq!(middle.len(), 8);
        assert_eq!(middle.capacity(), 8);
    });
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_saved_channels_match_acquired_words() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::open(3, "eth0");
    let mut device = offline_device(4, &transport);

    let tags = FrameTags {
        tag: 0xABCD,
        cluster: 4,
        address: 9,
    };
    device.acquire(3, 2, StripeMask::MIDDLE, tags).unwrap();
    let report = device.save_fits(&dir.path().join("exposure")).unwrap();
    assert!(report.is_success());

    let bytes = std::fs::read(dir.path().join("exposure.0b.fits")).unwrap();
    let hdus = read_hdus(&bytes).unwrap();
    assert_eq!(hdus.len(), 5);
    assert_eq!(hdus[0].header.integer("CLUSTER"), Some(4));
    assert_eq!(hdus[0].header.text("TAG"), Some("000000000000abcd"));

    for channel in 0..4u32 {
        let hdu = &hdus[channel as usize + 1];
        assert_eq!(hdu.header.integer("NAXIS1"), Some(2));
        assert_eq!(hdu.header.integer("NAXIS2"), Some(3));
        assert_eq!(hdu.header.integer("CHANNEL"), Some(i64::from(channel)));

        let codes: Vec<u32> = hdu.data.iter().map(|s| code_of(*s)).collect();
        let expected: Vec<u32> = (0..6).map(|p| p * 4 + channel).collect();
        assert_eq!(codes, expected, "channel {}", channel);
    }
}

#[test]
fn test_save_names_every_enabled_stripe() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::open(0, "eth0");
    let mut device = offline_device(2, &transport);

    device
        .acquire(1, 2, StripeMask::ALL_BITS, FrameTags::default())
        .unwrap();
    let report = device.save_fits(&dir.path().join("run")).unwrap();

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["run.0a.fits", "run.0b.fits", "run.0c.fits"]);
    assert_eq!(report.written().count(), 3);
}

#[test]
fn test_save_during_acquisition_reads_whole_frames() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StripeStore::new());
    let geometry = Geometry::new(8, 8, 2).unwrap();
    let mask = StripeMask::new(StripeMask::LEFT).unwrap();

    // Prime one frame so the first save has data
    let mut transport = MockTransport::open(0, "eth0");
    let mut demux = Demultiplexer::new(SignTransform::MidScaleComplement);
    demux
        .acquire(&store, &mut transport, geometry, mask, FrameTags::default())
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                demux
                    .acquire(&store, &mut transport, geometry, mask, FrameTags::default())
                    .unwrap();
            }
        })
    };

    let writer = FitsWriter::new(0, "fits");
    for round in 0..20 {
        let base = dir.path().join(format!("frame{}", round));
        let report = writer.save(&store, &base).unwrap();
        assert!(report.is_success());

        let bytes = std::fs::read(writer.output_path(&base, StripeId::Left)).unwrap();
        let hdus = read_hdus(&bytes).unwrap();
        let first = code_of(hdus[1].data[0]);
        for (channel, hdu) in hdus[1..].iter().enumerate() {
            for (pixel, sample) in hdu.data.iter().enumerate() {
                // Image n has word i = n + i; a torn read would break the progression
                let expected = (first + (pixel * 2 + channel) as u32) % 65_536;
                assert_eq!(code_of(*sample), expected, "round {} ch {} px {}", round, channel, pixel);
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    stop.store(true, Ordering::Release);
    producer.join().unwrap();
}
