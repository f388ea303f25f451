//! CLI Entry Point for reb-gige
//!
//! Provides command-line interface for:
//! - Simulating a board (mock hardware, live broadcast, optional FITS output)
//! - Listening to a board's broadcast and printing every stripe received
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Simulate board 0 at one frame per second, saving every frame:
//! ```bash
//! reb-gige simulate --height 200 --width 64 --save /tmp/exposure
//! ```
//!
//! Listen to it from another terminal:
//! ```bash
//! reb-gige listen --endpoint tcp://127.0.0.1:5550
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use reb_gige::broadcast::Subscriber;
use reb_gige::config::{RebConfig, DEFAULT_CONFIG_PATH};
use reb_gige::demux::SignTransform;
use reb_gige::hardware::{MockRegisterLink, MockTransport};
use reb_gige::logging::{self, OutputFormat};
use reb_gige::stripe::{FrameTags, StripeId};
use reb_gige::RebDevice;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "reb-gige")]
#[command(about = "REB readout: demultiplex, broadcast and persist sensor stripes", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json), overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    /// Log span open and close events
    #[arg(long, global = true)]
    log_spans: bool,

    /// Include source file and line in log events
    #[arg(long, global = true)]
    log_source: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated board with the broadcast publisher enabled
    Simulate {
        /// Rows per channel image
        #[arg(long, default_value_t = 2002)]
        height: u32,

        /// Columns per channel image
        #[arg(long, default_value_t = 512)]
        width: u32,

        /// Stripe enable mask; read from the board register when omitted
        #[arg(long)]
        mask: Option<u32>,

        /// Frames to acquire, 0 runs until Ctrl-C
        #[arg(long, default_value_t = 0)]
        frames: u64,

        /// Pause between frames
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Save every frame as FITS under this base path
        #[arg(long)]
        save: Option<PathBuf>,

        /// Sample transform (mid-scale-complement, bias-subtract)
        #[arg(long, default_value = "mid-scale-complement", value_parser = parse_transform)]
        transform: SignTransform,
    },

    /// Subscribe to a board and print every assembled stripe
    Listen {
        /// Publisher endpoint; defaults to the configured board on localhost
        #[arg(long)]
        endpoint: Option<String>,

        /// Rendezvous endpoint to sync with before each frame
        #[arg(long)]
        sync: Option<String>,

        /// Stripes to print before exiting, 0 runs until Ctrl-C
        #[arg(long, default_value_t = 0)]
        stripes: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_transform(value: &str) -> Result<SignTransform, String> {
    match value {
        "mid-scale-complement" => Ok(SignTransform::MidScaleComplement),
        "bias-subtract" => Ok(SignTransform::BiasSubtract),
        other => Err(format!(
            "Unknown transform '{}'. Must be mid-scale-complement or bias-subtract",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RebConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    config.application.log_spans |= cli.log_spans;
    config.application.log_source |= cli.log_source;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Simulate {
            height,
            width,
            mask,
            frames,
            interval_ms,
            save,
            transform,
        } => {
            let plan = SimulationPlan {
                height,
                width,
                mask,
                frames,
                interval: Duration::from_millis(interval_ms),
                save,
                transform,
            };
            run_until_interrupted(move |stop| simulate(config, plan, stop)).await
        }
        Commands::Listen {
            endpoint,
            sync,
            stripes,
        } => {
            let endpoint = endpoint.unwrap_or_else(|| {
                format!(
                    "tcp://127.0.0.1:{}",
                    u32::from(config.broadcast.base_port) + config.device.reb_id
                )
            });
            run_until_interrupted(move |stop| listen(&endpoint, sync.as_deref(), stripes, stop))
                .await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Run blocking `work` on the blocking pool; Ctrl-C raises its stop flag.
async fn run_until_interrupted<F>(work: F) -> Result<()>
where
    F: FnOnce(&AtomicBool) -> Result<()> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let mut worker = tokio::task::spawn_blocking({
        let stop = Arc::clone(&stop);
        move || work(stop.as_ref())
    });

    tokio::select! {
        result = &mut worker => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping");
            stop.store(true, Ordering::Release);
            worker.await?
        }
    }
}

struct SimulationPlan {
    height: u32,
    width: u32,
    mask: Option<u32>,
    frames: u64,
    interval: Duration,
    save: Option<PathBuf>,
    transform: SignTransform,
}

fn simulate(config: RebConfig, plan: SimulationPlan, stop: &AtomicBool) -> Result<()> {
    let reb_id = config.device.reb_id;
    let link = MockRegisterLink::with_stripes(plan.mask.unwrap_or(0x7));
    let transport = MockTransport::open(reb_id, &config.device.iface);

    let mut device = RebDevice::new(&config, Box::new(link), Some(Box::new(transport)))?
        .with_transform(plan.transform);
    let mask = device.read_stripe_mask()?;
    info!(reb_id, mask = mask.bits(), "Simulated board up");

    let mut frame = 0u64;
    while !stop.load(Ordering::Acquire) && (plan.frames == 0 || frame < plan.frames) {
        let tags = FrameTags {
            tag: frame,
            cluster: 0,
            address: reb_id,
        };
        let outcome = device.acquire(plan.height, plan.width, mask.bits(), tags)?;
        println!(
            "frame {:>5}: {} samples in {:.1} ms",
            frame,
            outcome.total_written(),
            outcome.elapsed.as_secs_f64() * 1e3
        );

        if let Some(base) = &plan.save {
            let mut name = base.clone().into_os_string();
            name.push(format!("_{:05}", frame));
            let report = device.save_fits(&PathBuf::from(name))?;
            for path in report.written() {
                println!("  wrote {}", path.display());
            }
            for (stripe, err) in report.failures() {
                warn!(stripe = %stripe, error = %err, "Stripe not saved");
            }
        }

        frame += 1;
        sleep_unless_stopped(plan.interval, stop);
    }

    device.shutdown();
    Ok(())
}

fn listen(endpoint: &str, sync: Option<&str>, stripes: u64, stop: &AtomicBool) -> Result<()> {
    let mut subscriber = Subscriber::connect(endpoint, &StripeId::ALL)?;
    info!(endpoint, "Listening for stripes");

    let mut received = 0u64;
    let mut synced = false;
    let mut last_tag = None;
    while !stop.load(Ordering::Acquire) && (stripes == 0 || received < stripes) {
        if let (Some(sync_endpoint), false) = (sync, synced) {
            match subscriber.sync(sync_endpoint, Duration::from_millis(500)) {
                Ok(()) => synced = true,
                Err(e) => {
                    warn!(error = %e, "Rendezvous failed, retrying");
                    continue;
                }
            }
        }

        let Some(stripe) = subscriber.recv_stripe(Duration::from_millis(200))? else {
            continue;
        };
        received += 1;
        // The publisher finishes a frame before it answers the next handshake, so
        // syncing on the first stripe of each frame books the following one
        if last_tag != Some(stripe.info.tag) {
            last_tag = Some(stripe.info.tag);
            synced = false;
        }
        println!(
            "stripe {} tag {:#x}: {}x{} x {} samples in {} chunks",
            stripe.id,
            stripe.info.tag,
            stripe.info.height,
            stripe.info.width,
            stripe.samples.len(),
            stripe.chunks
        );
    }
    Ok(())
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Acquire) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(Duration::from_millis(50)));
    }
}
