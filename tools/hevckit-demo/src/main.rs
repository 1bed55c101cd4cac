//! Drives hevckit-codec sessions end to end.
//!
//! Synthetic YUV 4:2:0 frames are encoded, polled and looped back into a
//! decoder, on either the platform codec service or the software passthrough.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hevckit_codec::sys::{PassthroughBackend, PlatformBackend};
use hevckit_codec::{
    CodecBackend, CodecSession, EncoderConfig, FrameFlags, Loopback, SessionOptions,
    SessionWorker, is_hevc_decoder_supported, is_hevc_encoder_supported,
};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "hevckit-demo")]
#[command(about = "Exercise hardware HEVC sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the platform can encode and decode HEVC
    Probe,
    /// Encode frames and feed every unit straight into a decoder
    Loopback {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Encode frames on a background worker while this thread consumes units
    Worker {
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Codec service to use
    #[arg(long, value_enum, default_value_t = BackendKind::Passthrough)]
    backend: BackendKind,
    /// Number of frames to encode
    #[arg(long, default_value_t = 30)]
    frames: u64,
    /// Encoder configuration as JSON (defaults to 1280x720 HEVC at 2 Mbps)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Software stand-in, available everywhere
    Passthrough,
    /// The platform hardware codec
    Platform,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Probe => {
            probe();
            Ok(())
        }
        Commands::Loopback { run } => {
            let config = load_config(run.config.as_deref())?;
            match run.backend {
                BackendKind::Passthrough => run_loopback(
                    PassthroughBackend::new(),
                    PassthroughBackend::new(),
                    config,
                    run.frames,
                ),
                BackendKind::Platform => run_loopback(
                    PlatformBackend::default(),
                    PlatformBackend::default(),
                    config,
                    run.frames,
                ),
            }
        }
        Commands::Worker { run } => {
            let config = load_config(run.config.as_deref())?;
            match run.backend {
                BackendKind::Passthrough => run_worker(PassthroughBackend::new(), config, run.frames),
                BackendKind::Platform => run_worker(PlatformBackend::default(), config, run.frames),
            }
        }
    }
}

fn probe() {
    let backend = PlatformBackend::default();
    for (what, supported) in [
        ("encoder", is_hevc_encoder_supported(&backend)),
        ("decoder", is_hevc_decoder_supported(&backend)),
    ] {
        if supported {
            println!("HEVC {what}: {}", "available".green().bold());
        } else {
            println!("HEVC {what}: {}", "not available".red().bold());
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EncoderConfig> {
    let Some(path) = path else {
        return Ok(EncoderConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: EncoderConfig =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
    config.validate().context("Invalid encoder configuration")?;
    Ok(config)
}

/// A mid-grey frame with a luma ramp that shifts every frame.
fn synthetic_frame(config: &EncoderConfig, index: u64) -> Vec<u8> {
    let mut frame = vec![0x80; config.frame_size()];
    let luma = config.width as usize * config.height as usize;
    for (i, pixel) in frame[..luma].iter_mut().enumerate() {
        *pixel = ((i as u64 + index * 4) % 256) as u8;
    }
    frame
}

fn frame_time_us(config: &EncoderConfig, index: u64) -> u64 {
    index * 1_000_000 / u64::from(config.frame_rate.max(1))
}

fn run_loopback<E: CodecBackend, D: CodecBackend>(
    encoder: E,
    decoder: D,
    config: EncoderConfig,
    frames: u64,
) -> Result<()> {
    println!(
        "{}",
        format!(
            "Loopback {}x{} {:?}, {frames} frames",
            config.width, config.height, config.codec
        )
        .green()
        .bold()
    );

    let mut loopback =
        Loopback::new(encoder, decoder, config, None).context("Failed to start codecs")?;
    let decoded = loopback.decoded_frames();

    let start = Instant::now();
    let mut busy = 0;
    for index in 0..frames {
        let frame = synthetic_frame(&config, index);
        if loopback
            .process(&frame, frame_time_us(&config, index))
            .context("Loopback failed")?
            .is_busy()
        {
            busy += 1;
        }
    }
    loopback.release();
    let elapsed = start.elapsed();

    let frames_out = decoded.drain();
    println!("  Units forwarded: {}", loopback.forwarded());
    println!("  Frames decoded:  {}", frames_out.len());
    println!("  Busy encoder:    {busy}");
    println!("  Total time:      {elapsed:?}");
    if let Some(last) = frames_out.last() {
        println!("  Last frame pts:  {}us", last.presentation_time_us);
    }
    Ok(())
}

fn run_worker<B>(backend: B, config: EncoderConfig, frames: u64) -> Result<()>
where
    B: CodecBackend + Send + 'static,
{
    println!(
        "{}",
        format!(
            "Worker {}x{} {:?}, {frames} frames",
            config.width, config.height, config.codec
        )
        .green()
        .bold()
    );

    let mut session =
        CodecSession::encoder(backend).with_options(SessionOptions::new().emit_codec_config(true));
    session.initialize(config).context("Failed to start encoder")?;
    let worker = SessionWorker::spawn(session).context("Failed to start worker")?;

    let units = worker.encoded_units();
    let consumer = thread::spawn(move || {
        let mut count = 0_usize;
        let mut bytes = 0_usize;
        while let Some(unit) = units.poll(Duration::from_secs(2)) {
            log::debug!(
                "unit {count}: {} bytes at {}us, flags {:#x}",
                unit.len(),
                unit.presentation_time_us(),
                unit.flags().bits()
            );
            count += 1;
            bytes += unit.len();
        }
        (count, bytes)
    });

    let start = Instant::now();
    for index in 0..frames {
        if index > 0 && index % u64::from(config.frame_rate.max(1)) == 0 {
            worker.request_key_frame()?;
        }
        worker.submit(
            synthetic_frame(&config, index),
            frame_time_us(&config, index),
            FrameFlags::NONE,
        )?;
    }
    let summary = worker.finish().context("Worker failed")?;
    let elapsed = start.elapsed();
    let (count, bytes) = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("Consumer thread panicked"))?;

    println!("  Submitted:      {}", summary.submitted);
    println!("  Busy retries:   {}", summary.busy_retries);
    println!("  Failed:         {}", summary.failed);
    println!("  Units received: {count} ({bytes} bytes)");
    println!("  Total time:     {elapsed:?}");
    if summary.failed > 0 {
        println!("{}", "Some submissions failed, see the log".yellow());
    }
    Ok(())
}
