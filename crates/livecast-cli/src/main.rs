//! livecast: stream an H.264 elementary stream file.
//!
//! ```text
//! livecast input.h264 --config session.json       Stream to the configured URL
//! livecast input.h264 --url rtmp://host/app --key k
//! livecast input.h264 --ts-out out.ts             Mux to a local MPEG-TS file
//! livecast --gen-config                           Print the default config
//! ```

mod source;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livecast_engine::{create_engine, Encoders, TsPipeline};
use livecast_ipc::{
    command_channel, event_channel, sample_channel, EncoderBitrate, EngineCommand, EngineEvent,
    EngineState, Sample, SessionConfig,
};

use crate::source::{split_access_units, AccessUnit};

#[derive(Parser, Debug)]
#[command(name = "livecast", about = "Stream an H.264 file over RTMP or SRT")]
struct Cli {
    /// Annex B H.264 elementary stream.
    input: Option<PathBuf>,

    /// Path to a session configuration JSON file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the target URL.
    #[arg(long)]
    url: Option<String>,

    /// Override the RTMP stream key.
    #[arg(long)]
    key: Option<String>,

    /// Write an MPEG-TS file instead of connecting.
    #[arg(long)]
    ts_out: Option<PathBuf>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "livecast=debug,livecast_engine=debug,livecast_transport=debug,livecast_mux=debug,livecast_abr=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Stands in for an encoder: there is nothing to re-encode, so bitrate
/// requests are only recorded.
struct FileEncoder {
    name: &'static str,
    bitrate: AtomicU32,
}

impl FileEncoder {
    fn new(name: &'static str, bitrate: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            bitrate: AtomicU32::new(bitrate),
        })
    }
}

impl EncoderBitrate for FileEncoder {
    fn bitrate(&self) -> u32 {
        self.bitrate.load(Ordering::SeqCst)
    }

    fn set_bitrate(&self, bps: u32) {
        let previous = self.bitrate.swap(bps, Ordering::SeqCst);
        if previous != bps {
            info!(encoder = self.name, previous, bps, "Encoder bitrate requested");
        }
    }
}

fn frame_duration_us(config: &SessionConfig) -> i64 {
    (1_000_000.0 / config.video.fps).round() as i64
}

fn to_sample(index: usize, unit: &AccessUnit, frame_us: i64) -> Sample {
    Sample::video(index as i64 * frame_us, None, unit.is_keyframe, unit.data.clone())
}

/// Mux every access unit into a TS file as fast as possible.
fn write_ts(config: &SessionConfig, units: &[AccessUnit], path: &Path) -> Result<()> {
    let frame_us = frame_duration_us(config);
    let mut pipeline = TsPipeline::new(config, Vec::new())?;
    for (index, unit) in units.iter().enumerate() {
        pipeline.push(&to_sample(index, unit, frame_us))?;
    }
    pipeline.flush()?;

    let bytes = pipeline.into_sink();
    std::fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), bytes = bytes.len(), frames = units.len(), "Wrote transport stream");
    Ok(())
}

/// Log an event and return the new state if it is a state change.
fn handle_event(event: EngineEvent) -> Result<Option<EngineState>> {
    match event {
        EngineEvent::StateChanged { previous, current } => {
            info!(from = previous.name(), to = current.name(), "State changed");
            Ok(Some(*current))
        }
        EngineEvent::Throughput(report) => {
            debug!(?report, "Throughput");
            Ok(None)
        }
        EngineEvent::BitrateChanged(update) => {
            info!(video = update.video_bps, audio = update.audio_bps, "Bitrate changed");
            Ok(None)
        }
        EngineEvent::Metrics(metrics) => {
            info!(
                sent = metrics.samples_sent,
                dropped = metrics.samples_dropped,
                kbps = metrics.bitrate_kbps,
                uptime = metrics.uptime_seconds,
                "Metrics"
            );
            Ok(None)
        }
        EngineEvent::Error {
            recoverable: true,
            message,
        } => {
            warn!("{}", message);
            Ok(None)
        }
        EngineEvent::Error { message, .. } => bail!(message),
        EngineEvent::Ready | EngineEvent::Shutdown => Ok(None),
    }
}

/// Wait until the session is live. Fails if the engine reports an error
/// or the deadline passes first.
fn wait_until_live(event_rx: &Receiver<EngineEvent>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = event_rx
            .recv_timeout(remaining)
            .context("timed out waiting for the session to go live")?;

        if let EngineEvent::Error { message, .. } = &event {
            bail!("failed to start: {message}");
        }
        match handle_event(event)? {
            Some(state) if state.is_live() => return Ok(()),
            Some(EngineState::Error { message, .. }) => bail!("failed to start: {message}"),
            Some(EngineState::Ended) => bail!("peer ended the session"),
            _ => {}
        }
    }
}

fn stream(config: SessionConfig, units: Vec<AccessUnit>) -> Result<()> {
    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();
    let (sample_tx, sample_rx) = sample_channel();

    let encoders = Encoders {
        video: FileEncoder::new("video", config.video.bitrate_bps),
        audio: None,
    };
    let mut engine = create_engine(encoders, event_tx);
    let engine_thread = thread::spawn(move || engine.run(command_rx, sample_rx));

    let connect_timeout = Duration::from_millis(config.rtmp.connect_timeout_ms) + Duration::from_secs(1);
    let frame_us = frame_duration_us(&config);
    command_tx.send(EngineCommand::Start {
        config: Box::new(config),
    })?;

    let result = (|| -> Result<()> {
        wait_until_live(&event_rx, connect_timeout)?;

        let started = Instant::now();
        for (index, unit) in units.iter().enumerate() {
            sample_tx.send(to_sample(index, unit, frame_us))?;

            for event in event_rx.try_iter() {
                match handle_event(event)? {
                    Some(EngineState::Ended) => bail!("peer ended the session"),
                    Some(EngineState::Error { message, .. }) => bail!(message),
                    _ => {}
                }
            }

            let due = started + Duration::from_micros(((index + 1) as i64 * frame_us) as u64);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
        info!(frames = units.len(), "Input finished");
        Ok(())
    })();

    let _ = command_tx.send(EngineCommand::Stop);
    let _ = command_tx.send(EngineCommand::Shutdown);
    drop(sample_tx);
    if engine_thread.join().is_err() {
        warn!("Engine thread panicked");
    }
    for event in event_rx.try_iter() {
        let _ = handle_event(event);
    }

    result
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", serde_json::to_string_pretty(&SessionConfig::default())?);
        return Ok(());
    }

    init_logging();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(url) = cli.url {
        config.url = url;
    }
    if let Some(key) = cli.key {
        config.stream_key = key;
    }
    config.validate()?;

    let input = cli.input.context("an input file is required")?;
    let data = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let units = split_access_units(&data);
    if units.is_empty() {
        bail!("no H.264 pictures found in {}", input.display());
    }
    info!(
        input = %input.display(),
        frames = units.len(),
        keyframes = units.iter().filter(|u| u.is_keyframe).count(),
        "Loaded input"
    );

    if let Some(path) = &cli.ts_out {
        return write_ts(&config, &units, path);
    }
    if config.url.is_empty() {
        bail!("no target URL; pass --url or set \"url\" in the config");
    }

    info!(url = %config.url, "livecast starting");
    stream(config, units)
}
