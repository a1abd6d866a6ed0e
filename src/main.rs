//! # hwc-dispatch
//!
//! Drives the dispatch scheduler against the simulated hardware-resource
//! manager: plugs in a set of displays, optionally mirrors the first one,
//! submits a number of frames and prints per-display statistics.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::thread;

use hwc_dispatch::config::DispatchConfig;
use hwc_dispatch::hwrm::sim::{SimulatedResourceManager, DEFAULT_INPUT_COUNT};
use hwc_dispatch::hwrm::HardwareResourceManager;
use hwc_dispatch::job::{LayerPayload, Rect};
use hwc_dispatch::{
    logging, BufferHandle, DispatchError, DisplayId, DisplayInfo, PixelFormat, Scheduler,
    SessionMode, SetJobOutcome, VisibleLayer,
};

#[derive(Parser)]
#[command(name = "hwc-dispatch")]
#[command(about = "Per-display composition dispatch scheduler, driven against a simulated composer")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/hwc-dispatch/dispatch.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Frames to submit per display
    #[arg(long, default_value_t = 120)]
    frames: u64,

    /// Physical displays to plug in
    #[arg(long, default_value_t = 1)]
    displays: u32,

    /// Mirror display 0 on every other display
    #[arg(long)]
    mirror: bool,

    /// Visible layers per frame
    #[arg(long, default_value_t = 6)]
    layers: usize,

    /// Always use the simplified resource assignment
    #[arg(long)]
    skip_detailed: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match DispatchConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            let config = DispatchConfig::default();
            logging::init(&config.logging, cli.debug);
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            return run(&cli, config);
        }
    };
    logging::init(&config.logging, cli.debug);
    info!("✅ Configuration loaded from: {}", cli.config);
    run(&cli, config)
}

fn run(cli: &Cli, config: DispatchConfig) -> Result<()> {
    info!("🚀 Starting hwc-dispatch {}", hwc_dispatch::VERSION);
    info!(
        "📄 Built {} from {}",
        option_env!("BUILD_DATE").unwrap_or("unknown"),
        option_env!("GIT_COMMIT").unwrap_or("unknown commit")
    );

    let period = config.vsync.period();
    let paced = config.vsync.paced;
    let sim = Arc::new(SimulatedResourceManager::new());
    let count = cli.displays.max(1);
    for id in 0..count {
        sim.set_supports_query(DisplayId(id), true);
    }
    let scheduler = Scheduler::new(config, Arc::clone(&sim) as Arc<dyn HardwareResourceManager>);

    let displays = (0..count)
        .map(|id| scheduler.on_plug_in(DisplayInfo::physical(id, DEFAULT_INPUT_COUNT)))
        .collect::<hwc_dispatch::Result<Vec<_>>>()
        .context("Failed to plug in displays")?;

    if cli.mirror {
        for &sink in displays.iter().skip(1) {
            scheduler
                .set_session_mode(sink, SessionMode::MirrorDecouple { source: displays[0] })
                .context("Failed to set up mirroring")?;
        }
    }

    for frame in 0..cli.frames {
        submit_frame(&scheduler, &sim, &displays, frame, cli)?;
        for &display in &displays {
            // Hosts hand these back to their producers; here they just close
            drop(scheduler.take_release_fences(display)?);
        }
        if paced {
            thread::sleep(period);
        }
    }

    for &display in &displays {
        scheduler.drain(display)?;
    }
    for (display, stats) in scheduler.all_stats() {
        info!(
            "📊 display {}: {} composed, {} not dirty, {} dropped ({:.1}%), {} skipped, avg {:.3}ms",
            display,
            stats.composed,
            stats.not_dirty,
            stats.dropped,
            stats.drop_rate(),
            stats.skipped,
            stats.avg_process_time().as_secs_f64() * 1000.0
        );
        println!("{}", serde_json::to_string(&stats)?);
    }

    scheduler.shutdown();
    info!("👋 hwc-dispatch finished");
    Ok(())
}

fn submit_frame(
    scheduler: &Scheduler,
    sim: &SimulatedResourceManager,
    displays: &[DisplayId],
    frame: u64,
    cli: &Cli,
) -> Result<()> {
    let mut active = Vec::new();
    for &display in displays {
        match scheduler.get_job(display) {
            Ok(_) => active.push(display),
            Err(e @ (DispatchError::FrameDropped { .. } | DispatchError::PoolExhausted { .. })) => {
                warn!("⏭️ display {}: {}", display, e);
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        if scheduler.session_mode(display)?.mirror_source().is_some() {
            continue;
        }
        // Every fourth frame repeats the previous content
        let content = if frame % 4 == 3 { frame - 1 } else { frame };
        scheduler.with_job(display, |job| {
            for z in 0..cli.layers {
                let id = (u64::from(display.0) << 48) | (content << 8) | z as u64;
                let mut layer = VisibleLayer::ui(
                    BufferHandle::new(id, 1920, 1080, PixelFormat::Rgba8888),
                    Rect::new(0, 0, 1920, 1080),
                )
                .with_acquire_fence(sim.ledger().create_signaled());
                if z == 0 {
                    layer = layer.with_payload(LayerPayload::DimColor { argb: 0x8000_0000 });
                }
                job.push_layer(layer);
            }
        })?;
    }

    let mut outcomes = if cli.mirror {
        scheduler.prepare_mirror(cli.skip_detailed)
    } else {
        scheduler.assign_resources(cli.skip_detailed);
        Vec::new()
    };
    for &display in &active {
        if !outcomes.iter().any(|(finalized, _)| *finalized == display) {
            outcomes.push((display, scheduler.set_job(display)));
        }
    }

    for (display, outcome) in outcomes {
        match outcome? {
            SetJobOutcome::Ready(_) => scheduler.trigger(display)?,
            SetJobOutcome::NotDirty => {}
            SetJobOutcome::Skipped { returned } => {
                warn!("⚠️ display {}: frame {} skipped, {} fences returned", display, frame, returned.len());
            }
        }
    }
    Ok(())
}
