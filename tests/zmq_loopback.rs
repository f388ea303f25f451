//! Loopback tests over real ZMQ sockets
//!
//! A device with the image service enabled publishes on an IPC endpoint inside a
//! temporary directory and a `Subscriber` reads the stripes back. PUB/SUB drops
//! whatever is sent before the subscription is live, so every test keeps acquiring
//! until the first complete stripe arrives.

use reb_gige::broadcast::Subscriber;
use reb_gige::config::RebConfig;
use reb_gige::hardware::{MockRegisterLink, MockTransport};
use reb_gige::stripe::{FrameTags, StripeId, StripeMask};
use reb_gige::RebDevice;
use serial_test::serial;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(200);
const TEST_DEADLINE: Duration = Duration::from_secs(20);

/// Distinct TCP ports per test binary run, since every device also binds TCP
fn test_port(offset: u16) -> u16 {
    20_000 + (std::process::id() % 20_000) as u16 + offset * 7
}

fn loopback_config(dir: &TempDir, reb_id: u32, port_offset: u16) -> RebConfig {
    let mut config = RebConfig::default();
    config.device.reb_id = reb_id;
    config.device.channels = 2;
    config.broadcast.bind_host = "127.0.0.1".to_string();
    config.broadcast.base_port = test_port(port_offset);
    config.broadcast.ipc_path_template = format!("{}/reb_{{id}}.ipc", dir.path().display());
    config.broadcast.wait_timeout_ms = 10;
    config
}

fn start_device(config: &RebConfig, transport: &MockTransport) -> RebDevice {
    RebDevice::new(
        config,
        Box::new(MockRegisterLink::with_stripes(0x7)),
        Some(Box::new(transport.clone())),
    )
    .unwrap()
}

#[test]
#[serial]
fn test_stripes_arrive_over_ipc() {
    let dir = tempfile::tempdir().unwrap();
    let config = loopback_config(&dir, 1, 0);
    let transport = MockTransport::open(1, "lo");
    let mut device = start_device(&config, &transport);

    let endpoint = config.broadcast.ipc_endpoint(1);
    let mut subscriber = Subscriber::connect(&endpoint, &StripeId::ALL).unwrap();

    let deadline = Instant::now() + TEST_DEADLINE;
    let mut frame = 0u64;
    let received = loop {
        assert!(Instant::now() < deadline, "no stripe received from {}", endpoint);
        let tags = FrameTags {
            tag: frame,
            cluster: 2,
            address: 1,
        };
        device
            .acquire(3, 4, StripeMask::LEFT | StripeMask::RIGHT, tags)
            .unwrap();
        frame += 1;
        if let Some(stripe) = subscriber.recv_stripe(ATTEMPT_TIMEOUT).unwrap() {
            break stripe;
        }
    };

    assert!(matches!(received.id, StripeId::Left | StripeId::Right));
    assert_eq!(received.samples.len(), 3 * 4 * 2);
    assert_eq!((received.info.height, received.info.width), (3, 4));
    assert_eq!(received.info.cluster, 2);
    assert!(received.info.tag < frame);

    let published = device.publisher().unwrap().stats().frames_published();
    assert!(published >= 1);

    device.shutdown();
    assert!(device.publisher().is_none());
}

#[test]
#[serial]
fn test_subscriber_filters_by_stripe() {
    let dir = tempfile::tempdir().unwrap();
    let config = loopback_config(&dir, 2, 1);
    let transport = MockTransport::open(2, "lo");
    let mut device = start_device(&config, &transport);

    let mut subscriber =
        Subscriber::connect(&config.broadcast.ipc_endpoint(2), &[StripeId::Middle]).unwrap();

    let deadline = Instant::now() + TEST_DEADLINE;
    let mut seen = Vec::new();
    while seen.len() < 3 {
        assert!(Instant::now() < deadline, "only {} stripes received", seen.len());
        device
            .acquire(1, 2, StripeMask::ALL_BITS, FrameTags::default())
            .unwrap();
        while let Some(stripe) = subscriber.recv_stripe(ATTEMPT_TIMEOUT).unwrap() {
            seen.push(stripe.id);
        }
    }

    assert!(seen.iter().all(|id| *id == StripeId::Middle));
}

#[test]
#[serial]
fn test_rendezvous_gates_each_frame() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = loopback_config(&dir, 3, 2);
    let sync_endpoint = format!("ipc://{}/sync.ipc", dir.path().display());
    config.broadcast.rendezvous.enabled = true;
    config.broadcast.rendezvous.endpoint = sync_endpoint.clone();
    config.broadcast.rendezvous.subscribers_expected = 1;

    let transport = MockTransport::open(3, "lo");
    let mut device = start_device(&config, &transport);
    device
        .acquire(2, 2, StripeMask::LEFT, FrameTags::default())
        .unwrap();

    // Without a handshake the frame stays unpublished
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(device.publisher().unwrap().stats().frames_published(), 0);
    assert!(device.store().with_lock(|s| s.frame_ready()));

    let mut subscriber =
        Subscriber::connect(&config.broadcast.ipc_endpoint(3), &StripeId::ALL).unwrap();

    let deadline = Instant::now() + TEST_DEADLINE;
    let received = loop {
        assert!(Instant::now() < deadline, "no stripe after rendezvous");
        subscriber
            .sync(&sync_endpoint, Duration::from_secs(2))
            .unwrap();
        if let Some(stripe) = subscriber.recv_stripe(ATTEMPT_TIMEOUT).unwrap() {
            break stripe;
        }
        // The handshake released a frame this subscriber missed; queue another
        device
            .acquire(2, 2, StripeMask::LEFT, FrameTags::default())
            .unwrap();
    };

    assert_eq!(received.id, StripeId::Left);
    assert_eq!(received.samples.len(), 8);
    device.shutdown();
}

#[test]
#[serial]
fn test_shutdown_is_prompt_while_idle() {
    let dir = tempfile::tempdir().unwrap();
    let config = loopback_config(&dir, 4, 3);
    let transport = MockTransport::open(4, "lo");
    let mut device = start_device(&config, &transport);

    let start = Instant::now();
    device.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2));
}
