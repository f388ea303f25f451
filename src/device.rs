//! One readout board: register access, acquisition, broadcast and persistence.
//!
//! `RebDevice` ties the pieces together the way a caller uses them:
//!
//! ```rust,ignore
//! let mut device = RebDevice::new(&config, Box::new(link), Some(Box::new(transport)))?;
//! let mask = device.read_stripe_mask()?;
//! device.acquire(2002, 512, mask.bits(), FrameTags::default())?;  // publisher wakes up
//! let report = device.save_fits(Path::new("/data/exposure"))?;
//! device.shutdown();
//! ```
//!
//! Dropping the device stops and joins the publisher thread.

use crate::broadcast::{Publisher, PublisherSettings};
use crate::config::RebConfig;
use crate::demux::{AcquisitionOutcome, Demultiplexer, SignTransform};
use crate::error::{AppResult, RebError};
use crate::hardware::{PixelTransport, RegisterLink, STRIPE_ADDR};
use crate::storage::{FitsWriter, SaveReport};
use crate::store::StripeStore;
use crate::stripe::{FrameTags, Geometry, StripeMask};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

/// Facade over one board and its pipeline.
pub struct RebDevice {
    reb_id: u32,
    channels: u32,
    link: Box<dyn RegisterLink>,
    transport: Option<Box<dyn PixelTransport>>,
    store: Arc<StripeStore>,
    demux: Demultiplexer,
    publisher: Option<Publisher>,
    writer: FitsWriter,
}

impl std::fmt::Debug for RebDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebDevice")
            .field("reb_id", &self.reb_id)
            .field("channels", &self.channels)
            .field("transport", &self.transport.is_some())
            .field("publisher", &self.publisher)
            .finish()
    }
}

impl RebDevice {
    /// Validate `config` and bring the board up.
    ///
    /// The broadcast publisher is started when `device.image_service` is set. Without
    /// a transport the device still answers register requests but cannot acquire.
    pub fn new(
        config: &RebConfig,
        link: Box<dyn RegisterLink>,
        transport: Option<Box<dyn PixelTransport>>,
    ) -> AppResult<Self> {
        config.validate()?;
        let reb_id = config.device.reb_id;
        let store = Arc::new(StripeStore::new());
        let writer = FitsWriter::from_config(reb_id, &config.storage)?;

        let publisher = if config.device.image_service {
            let settings = PublisherSettings::from_config(reb_id, &config.broadcast);
            Some(Publisher::start(Arc::clone(&store), settings)?)
        } else {
            None
        };

        info!(
            reb_id,
            ip_addr = %config.device.ip_addr,
            iface = %config.device.iface,
            channels = config.device.channels,
            image_service = config.device.image_service,
            "REB device ready"
        );

        Ok(Self {
            reb_id,
            channels: config.device.channels,
            link,
            transport,
            store,
            demux: Demultiplexer::default(),
            publisher,
            writer,
        })
    }

    /// Use `transform` for every subsequent acquisition.
    pub fn with_transform(mut self, transform: SignTransform) -> Self {
        self.demux = Demultiplexer::new(transform);
        self
    }

    /// Board id.
    pub fn reb_id(&self) -> u32 {
        self.reb_id
    }

    /// Shared stripe buffers.
    pub fn store(&self) -> &Arc<StripeStore> {
        &self.store
    }

    /// Running publisher, if the image service is enabled.
    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    /// Read one board register.
    pub fn read_register(&self, address: u32) -> AppResult<u32> {
        self.link
            .read(address)
            .map_err(|e| RebError::Register {
                operation: "read",
                address,
                message: format!("{:#}", e),
            })
    }

    /// Write one board register.
    pub fn write_register(&self, address: u32, value: u32) -> AppResult<()> {
        self.link
            .write(address, value)
            .map_err(|e| RebError::Register {
                operation: "write",
                address,
                message: format!("{:#}", e),
            })
    }

    /// Stripes the board reports as enabled.
    pub fn read_stripe_mask(&self) -> AppResult<StripeMask> {
        self.read_register(STRIPE_ADDR).map(StripeMask::from_register)
    }

    /// Acquire one frame of `height x width` pixels per channel for the stripes in
    /// `mask`, then hand it to the publisher.
    ///
    /// Invalid geometry or mask is rejected before the store is touched. Transport
    /// problems are reported in the outcome only.
    #[instrument(skip(self), fields(reb_id = self.reb_id), err)]
    pub fn acquire(
        &mut self,
        height: u32,
        width: u32,
        mask: u32,
        tags: FrameTags,
    ) -> AppResult<AcquisitionOutcome> {
        let geometry = Geometry::new(height, width, self.channels)?;
        let mask = StripeMask::new(mask)?;
        let transport = self.transport.as_deref_mut().ok_or_else(|| {
            RebError::Configuration("Device has no pixel transport".to_string())
        })?;
        self.demux
            .acquire(&self.store, transport, geometry, mask, tags)
    }

    /// Write every enabled stripe of the current frame to
    /// `<base>.<reb_id><letter>.<extension>`.
    pub fn save_fits(&self, base: &Path) -> AppResult<SaveReport> {
        self.writer.save(&self.store, base)
    }

    /// Stop the publisher thread. Further acquisitions are not broadcast.
    pub fn shutdown(&mut self) {
        if let Some(mut publisher) = self.publisher.take() {
            publisher.stop();
            info!(reb_id = self.reb_id, "REB device shut down");
        }
    }
}

impl Drop for RebDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
