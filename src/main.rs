/// Wake-word detection service binary
///
/// Streams a 16 kHz mono WAV file through a wake-word worker and logs every
/// detection.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wakeword_worker::engine::ENERGY_ENGINE_VERSION;
use wakeword_worker::{
    detection_channel, AssetRegistry, AssetVariant, Detection, FrameBuffer, ServiceConfig, WakeWordWorker,
    WorkerEnvironment,
};

/// Samples read from the file per block
const READ_BLOCK: usize = 1024;

#[derive(Parser)]
#[command(name = "wakeword-service")]
#[command(about = "Wake-word detection over a WAV file", long_about = None)]
struct Cli {
    /// Input WAV file (16 kHz mono, 16-bit PCM)
    input: PathBuf,

    /// Pace frames at sample_rate / frame_length
    #[arg(long)]
    realtime: bool,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wakeword_worker=debug,info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting wake-word detection service");

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Wake-word detection service stopped");
}

fn detection_message(detection: &Detection, frames_sent: u64) -> String {
    format!(
        "Wake-word detected! keyword='{}' (index {}), frames_sent={}",
        detection.label, detection.index, frames_sent
    )
}

fn log_detection(detection: &Detection, frames_sent: u64) {
    info!("{}", detection_message(detection, frames_sent));
}

async fn run(cli: Cli) -> Result<()> {
    let Cli { input, realtime } = cli;

    let config = ServiceConfig::load().context("Failed to load configuration")?;

    let registry = AssetRegistry::global();
    let payload = match &config.engine_binary {
        Some(path) => std::fs::read(path).with_context(|| format!("Failed to read engine binary {}", path.display()))?,
        None => ENERGY_ENGINE_VERSION.as_bytes().to_vec(),
    };
    registry.set(AssetVariant::Baseline, payload);

    let env = WorkerEnvironment::local(&config.storage_dir);
    let (on_detection, mut detections) = detection_channel();

    let worker = WakeWordWorker::create(
        &env,
        &config.access_key,
        config.keyword_specs(),
        on_detection,
        config.model_source(),
        config.engine_options(),
    )
    .await
    .context("Failed to create wake-word worker")?;

    let mut reader = hound::WavReader::open(&input).with_context(|| format!("Failed to open {}", input.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        bail!("{} must be mono 16-bit PCM", input.display());
    }
    if spec.sample_rate != worker.sample_rate() {
        bail!(
            "{} is sampled at {} Hz, engine expects {} Hz",
            input.display(),
            spec.sample_rate,
            worker.sample_rate()
        );
    }

    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to decode WAV samples")?;

    info!(
        "Streaming {} samples from {} (keywords: {:?})",
        samples.len(),
        input.display(),
        worker.keyword_labels()
    );

    let frame_period = Duration::from_secs_f64(worker.frame_length() as f64 / worker.sample_rate() as f64);
    let mut ticker = tokio::time::interval(frame_period);
    let mut buffer = FrameBuffer::new(worker.frame_length())?;
    let mut frames_sent = 0u64;
    let mut detected = 0u64;

    for block in samples.chunks(READ_BLOCK) {
        buffer.push(block);
        while let Some(frame) = buffer.next_frame() {
            if realtime {
                ticker.tick().await;
            }
            worker.process(&frame);
            frames_sent += 1;
        }

        while let Ok(detection) = detections.try_recv() {
            detected += 1;
            log_detection(&detection, frames_sent);
        }
        tokio::task::yield_now().await;
    }

    // release answers only after every queued frame
    worker.release().await.context("Failed to release engine")?;

    while let Ok(detection) = detections.try_recv() {
        detected += 1;
        log_detection(&detection, frames_sent);
    }

    info!("Processed {} frames, detected {} wake-words", frames_sent, detected);
    Ok(())
}
