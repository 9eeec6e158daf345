use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use voicestream::http::{HttpEventSource, SpeechStreamBody, StreamRequest};
use voicestream::{
    AudioOutput, ByteSource, EngineConfig, EngineEvent, PlaybackEngine, ProgressSnapshot,
    ReaderSource, SilentOutput, StreamError,
};

#[derive(Parser)]
#[command(name = "voicestream")]
#[command(about = "Voicestream CLI - Play streamed text-to-speech as it is generated", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request speech from a streaming endpoint and play it as it arrives
    Stream {
        /// Streaming endpoint URL
        #[arg(short, long)]
        url: String,

        /// Text to speak
        #[arg(short, long)]
        text: String,

        /// Saved voice prompt id
        #[arg(long)]
        prompt_id: Option<String>,

        /// Reference audio URL for voice cloning
        #[arg(long)]
        ref_audio_url: Option<String>,

        /// Transcript of the reference audio
        #[arg(long)]
        ref_text: Option<String>,

        #[arg(long, default_value = "Auto")]
        language: String,

        /// Max characters per generated chunk
        #[arg(long, default_value = "500")]
        chunk_size: u32,

        #[arg(long)]
        seed: Option<u64>,

        /// Value for the X-API-Key header
        #[arg(long)]
        api_key: Option<String>,

        /// Write the combined WAV file here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not open an audio device
        #[arg(long)]
        no_play: bool,
    },
    /// Replay a captured event stream from disk
    Replay {
        /// File holding `data: {...}` event lines
        #[arg(short, long)]
        input: PathBuf,

        /// Write the combined WAV file here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not open an audio device
        #[arg(long)]
        no_play: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Stream {
            url,
            text,
            prompt_id,
            ref_audio_url,
            ref_text,
            language,
            chunk_size,
            seed,
            api_key,
            output,
            no_play,
        } => {
            let mut body = SpeechStreamBody::new(text)
                .with_language(language)
                .with_chunk_size(chunk_size);
            if let Some(prompt_id) = prompt_id {
                body = body.with_prompt_id(prompt_id);
            }
            if let Some(ref_audio_url) = ref_audio_url {
                body = body.with_reference(ref_audio_url, ref_text);
            }
            if let Some(seed) = seed {
                body = body.with_seed(seed);
            }

            let mut request = StreamRequest::new(&url, &body)?;
            if let Some(api_key) = api_key {
                request = request.with_api_key(api_key);
            }

            log::info!("Requesting speech from {}", url);
            let client = reqwest::Client::new();
            let source = HttpEventSource::connect(&client, &request)
                .await
                .with_context(|| format!("Failed to connect to {}", url))?;
            play(config, source, output, no_play).await?;
        }
        Commands::Replay {
            input,
            output,
            no_play,
        } => {
            log::info!("Replaying {:?}", input);
            let file = tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("Failed to open {:?}", input))?;
            play(config, ReaderSource::new(file), output, no_play).await?;
        }
    }

    Ok(())
}

#[cfg(feature = "playback")]
fn open_output(no_play: bool) -> Box<dyn AudioOutput> {
    if !no_play {
        match voicestream::playback::DeviceOutput::try_new() {
            Ok(device) => return Box::new(device),
            Err(e) => log::warn!("{}; continuing without audio", e),
        }
    }
    Box::new(SilentOutput::new())
}

#[cfg(not(feature = "playback"))]
fn open_output(no_play: bool) -> Box<dyn AudioOutput> {
    if !no_play {
        log::warn!("Built without the `playback` feature; continuing without audio");
    }
    Box::new(SilentOutput::new())
}

async fn play<S>(
    config: EngineConfig,
    source: S,
    output: Option<PathBuf>,
    no_play: bool,
) -> Result<()>
where
    S: ByteSource + 'static,
{
    let engine = PlaybackEngine::new(config, open_output(no_play))?;

    let progress_task = tokio::spawn(print_progress(engine.progress()));
    let events_task = tokio::spawn(log_events(engine.subscribe()));
    let control_task = tokio::spawn(handle_controls(engine.clone(), spawn_stdin_reader()));

    let result = engine.run(source).await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(StreamError::Aborted) => {
            eprintln!("\nStopped.");
            progress_task.abort();
            control_task.abort();
            events_task.abort();
            return Ok(());
        }
        Err(e) => {
            progress_task.abort();
            control_task.abort();
            events_task.abort();
            return Err(e).context("Streaming failed");
        }
    };

    if let Some(path) = &output {
        save(&outcome.artifact, path)?;
    }

    if !no_play {
        engine.drain().await;
    }
    progress_task.abort();
    control_task.abort();
    events_task.abort();

    println!("\n========== Speech Result ==========");
    if !outcome.transcript.is_empty() {
        println!("{}", outcome.transcript);
    }
    println!("{}", outcome.metrics);
    println!("===================================\n");

    Ok(())
}

fn save(artifact: &voicestream::CombinedArtifact, path: &Path) -> Result<()> {
    artifact
        .write_to(path)
        .with_context(|| format!("Failed to write {:?}", path))?;
    eprintln!(
        "\nSaved {:.1}s of audio to {:?}",
        artifact.duration_secs(),
        path
    );
    Ok(())
}

async fn print_progress(mut progress: watch::Receiver<ProgressSnapshot>) {
    while progress.changed().await.is_ok() {
        let snapshot = progress.borrow_and_update().clone();
        let percent = snapshot
            .percent()
            .map(|p| format!("{p:>3.0}%"))
            .unwrap_or_else(|| "  -%".to_string());
        eprint!(
            "\r{} {} | {} | {}        ",
            percent,
            snapshot.time_text(),
            snapshot.duration_text(),
            snapshot.status_line()
        );
        let _ = std::io::stderr().flush();
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<EngineEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            EngineEvent::ChunkDropped { index, reason, .. } => {
                log::warn!("Chunk {} skipped: {}", index, reason);
            }
            EngineEvent::Failed { message, .. } => {
                log::error!("{}", message);
            }
            other => log::debug!("{:?}", other),
        }
    }
}

enum Control {
    TogglePause,
    Stop,
}

/// Read transport commands from stdin on a plain thread; a blocking stdin
/// read must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Control> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let control = match line.trim() {
                "p" => Control::TogglePause,
                "q" => Control::Stop,
                _ => continue,
            };
            if tx.send(control).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_controls(engine: PlaybackEngine, mut controls: mpsc::UnboundedReceiver<Control>) {
    while let Some(control) = controls.recv().await {
        match control {
            Control::TogglePause => engine.toggle_pause(),
            Control::Stop => {
                engine.stop();
                break;
            }
        }
    }
}
