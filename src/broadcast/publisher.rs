//! Broadcast publisher thread.
//!
//! Architecture:
//! ```text
//! acquisition pass            publisher thread                 subscribers
//!       │                            │                              │
//!  complete_frame ──notify_all──► wait_ready (condvar)              │
//!       │                            │  lock held                   │
//!       │                       emit_frame ── PUB tcp:// + ipc:// ──► SUB
//!       │                            │                              │
//!       │                       clear ready flag, unlock            │
//! ```
//!
//! The socket runs with an unbounded send high-water mark: slow subscribers make the
//! queue grow instead of stalling the loop or dropping frames.
//!
//! With rendezvous enabled, a REP socket collects `subscribers_expected` sync requests
//! before every published frame, so a subscriber that connects late does not miss the
//! start of a stripe.
//!
//! The thread observes a stop flag on every wait. [`Publisher::stop`] raises it, wakes
//! the thread and joins it; dropping the publisher does the same.

use crate::broadcast::protocol::emit_frame;
use crate::config::BroadcastConfig;
use crate::error::{AppResult, RebError};
use crate::store::StripeStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where and how one board's publisher broadcasts.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Board id, used in the thread name
    pub reb_id: u32,
    /// Endpoints the PUB socket binds
    pub endpoints: Vec<String>,
    /// Samples per data message
    pub chunk_samples: usize,
    /// Upper bound on one wait before the stop flag is rechecked
    pub wait_timeout: Duration,
    /// Optional subscriber handshake
    pub rendezvous: Option<RendezvousSettings>,
}

/// Subscriber handshake settings.
#[derive(Debug, Clone)]
pub struct RendezvousSettings {
    /// REP endpoint to bind
    pub endpoint: String,
    /// Sync requests required before each frame
    pub subscribers_expected: u32,
}

impl PublisherSettings {
    /// Settings for board `reb_id` from the broadcast section of the configuration.
    pub fn from_config(reb_id: u32, config: &BroadcastConfig) -> Self {
        let rendezvous = config.rendezvous.enabled.then(|| RendezvousSettings {
            endpoint: config.rendezvous.endpoint.clone(),
            subscribers_expected: config.rendezvous.subscribers_expected,
        });
        Self {
            reb_id,
            endpoints: vec![config.tcp_endpoint(reb_id), config.ipc_endpoint(reb_id)],
            chunk_samples: config.chunk_samples,
            wait_timeout: Duration::from_millis(config.wait_timeout_ms.max(1)),
            rendezvous,
        }
    }
}

/// Counters updated by the publisher thread.
#[derive(Debug, Default)]
pub struct PublisherStats {
    /// Frames fully emitted
    pub frames_published: AtomicU64,
    /// Data messages sent
    pub chunks_sent: AtomicU64,
    /// Cycles that failed part way through
    pub cycle_errors: AtomicU64,
}

impl PublisherStats {
    /// Frames fully emitted so far.
    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }

    /// Cycles that failed part way through.
    pub fn cycle_errors(&self) -> u64 {
        self.cycle_errors.load(Ordering::Relaxed)
    }
}

/// Handle to a running publisher thread.
pub struct Publisher {
    running: Arc<AtomicBool>,
    store: Arc<StripeStore>,
    thread_handle: Option<JoinHandle<()>>,
    stats: Arc<PublisherStats>,
    endpoints: Vec<String>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("running", &self.is_running())
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl Publisher {
    /// Bind the broadcast sockets and start the publisher thread.
    ///
    /// Socket and bind failures are returned here, before the thread exists. A thread
    /// spawn failure is returned as [`RebError::ThreadSpawn`].
    pub fn start(store: Arc<StripeStore>, settings: PublisherSettings) -> AppResult<Self> {
        if settings.chunk_samples == 0 {
            return Err(RebError::Configuration(
                "Broadcast chunk size must be positive".to_string(),
            ));
        }

        let context = zmq::Context::new();
        let publisher = context.socket(zmq::PUB)?;
        publisher.set_sndhwm(0)?;
        publisher.set_linger(0)?;
        for endpoint in &settings.endpoints {
            publisher.bind(endpoint)?;
        }

        let sync = match &settings.rendezvous {
            Some(rendezvous) => {
                let socket = context.socket(zmq::REP)?;
                socket.set_linger(0)?;
                socket.bind(&rendezvous.endpoint)?;
                Some((socket, rendezvous.subscribers_expected))
            }
            None => None,
        };

        info!(
            reb_id = settings.reb_id,
            endpoints = ?settings.endpoints,
            rendezvous = settings.rendezvous.is_some(),
            "Broadcast publisher listening"
        );

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(PublisherStats::default());
        let endpoints = settings.endpoints.clone();
        let name = format!("reb-publisher-{}", settings.reb_id);

        let thread_handle = {
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            let store = Arc::clone(&store);
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    // Context must outlive its sockets
                    let _context = context;
                    let mut worker = PublisherLoop {
                        store,
                        socket: publisher,
                        sync,
                        running,
                        stats,
                        chunk_samples: settings.chunk_samples,
                        wait_timeout: settings.wait_timeout,
                    };
                    worker.run();
                })
                .map_err(|source| RebError::ThreadSpawn { name, source })?
        };

        Ok(Self {
            running,
            store,
            thread_handle: Some(thread_handle),
            stats,
            endpoints,
        })
    }

    /// Whether the thread has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bound endpoints.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Thread counters.
    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    /// Signal the thread to stop and wait for it.
    ///
    /// A cycle already emitting finishes first. Safe to call more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.store.notify_all();

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Broadcast publisher thread panicked");
            } else {
                debug!(endpoints = ?self.endpoints, "Broadcast publisher stopped");
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PublisherLoop {
    store: Arc<StripeStore>,
    socket: zmq::Socket,
    sync: Option<(zmq::Socket, u32)>,
    running: Arc<AtomicBool>,
    stats: Arc<PublisherStats>,
    chunk_samples: usize,
    wait_timeout: Duration,
}

impl PublisherLoop {
    fn run(&mut self) {
        let mut synced = 0u32;

        while self.running.load(Ordering::Acquire) {
            if let Some((sync, expected)) = &self.sync {
                if synced < *expected {
                    match accept_sync(sync, self.wait_timeout) {
                        Ok(true) => {
                            synced += 1;
                            debug!(synced, expected, "Subscriber synchronised");
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "Rendezvous handshake failed"),
                    }
                    continue;
                }
            }

            let mut state = self.store.wait_ready(self.wait_timeout);
            if !state.frame_ready() {
                continue;
            }

            match emit_frame(&mut self.socket, &state, self.chunk_samples) {
                Ok(emitted) => {
                    let chunks: usize = emitted.iter().map(|(_, s)| s.chunks).sum();
                    self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .chunks_sent
                        .fetch_add(chunks as u64, Ordering::Relaxed);
                    debug!(stripes = emitted.len(), chunks, "Frame published");
                }
                Err(e) => {
                    self.stats.cycle_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Broadcast cycle failed, frame dropped");
                }
            }

            state.take_ready();
            drop(state);
            synced = 0;
        }
    }
}

/// Answer one pending sync request, waiting at most `timeout`.
fn accept_sync(socket: &zmq::Socket, timeout: Duration) -> AppResult<bool> {
    let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    if socket.poll(zmq::POLLIN, timeout_ms)? == 0 {
        return Ok(false);
    }
    socket.recv_bytes(0)?;
    socket.send("", 0)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let mut config = BroadcastConfig::default();
        config.rendezvous.enabled = true;
        config.rendezvous.subscribers_expected = 2;

        let settings = PublisherSettings::from_config(3, &config);
        assert_eq!(
            settings.endpoints,
            vec!["tcp://*:5553".to_string(), "ipc:///tmp/reb_3.ipc".to_string()]
        );
        let rendezvous = settings.rendezvous.unwrap();
        assert_eq!(rendezvous.subscribers_expected, 2);
        assert_eq!(rendezvous.endpoint, "tcp://*:5562");
    }

    #[test]
    fn rendezvous_disabled_by_default() {
        let settings = PublisherSettings::from_config(0, &BroadcastConfig::default());
        assert!(settings.rendezvous.is_none());
        assert_eq!(settings.chunk_samples, 250_000);
    }

    #[test]
    fn zero_chunk_rejected_before_binding() {
        let mut settings = PublisherSettings::from_config(0, &BroadcastConfig::default());
        settings.chunk_samples = 0;
        settings.endpoints.clear();
        let err = Publisher::start(Arc::new(StripeStore::new()), settings).unwrap_err();
        assert!(matches!(err, RebError::Configuration(_)));
    }

    #[test]
    fn start_and_stop_on_inproc() {
        let mut settings = PublisherSettings::from_config(0, &BroadcastConfig::default());
        settings.endpoints = vec!["inproc://publisher-start-stop".to_string()];
        settings.wait_timeout = Duration::from_millis(5);

        let mut publisher = Publisher::start(Arc::new(StripeStore::new()), settings).unwrap();
        assert!(publisher.is_running());
        publisher.stop();
        assert!(!publisher.is_running());
        publisher.stop();
    }

    #[test]
    fn bind_failure_is_reported() {
        let mut settings = PublisherSettings::from_config(0, &BroadcastConfig::default());
        settings.endpoints = vec!["bogus://nowhere".to_string()];
        let err = Publisher::start(Arc::new(StripeStore::new()), settings).unwrap_err();
        assert!(matches!(err, RebError::Broadcast(_)));
    }
}
