use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use remy::camera::CameraCapture;
use remy::daemon::{build_camera, build_source, build_tts};
use remy::history::{ChatHistory, HistoryStore, JsonHistoryStore};
use remy::voice::{AudioPlayback, frame_energy};
use remy::{Config, Daemon};

/// Remy - wake-phrase vision assistant
#[derive(Parser)]
#[command(name = "remy", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/remy/config.toml)
    #[arg(short, long, env = "REMY_CONFIG")]
    config: Option<PathBuf>,

    /// Disable the periodic capture loop
    #[arg(long)]
    no_active: bool,

    /// Serve the HTTP API on this port
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Take one photo with the configured camera
    TestCamera,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Inspect or reset the saved conversation
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Print the saved conversation
    Show,
    /// Delete every saved message
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,remy=info",
        1 => "info,remy=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.no_active {
        config.active.enabled = false;
    }
    if let Some(port) = cli.port {
        config.api_server.enabled = true;
        config.api_server.port = port;
    }

    // Handle subcommands
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestCamera => test_camera(&config).await,
            Command::TestTts { text } => test_tts(&config, &text).await,
            Command::History { action } => history(&config, &action),
        };
    }

    tracing::info!(
        language = %config.voice.language,
        active = config.active.enabled,
        api = config.api_server.enabled,
        "starting remy"
    );

    Daemon::new(config).run().await?;

    Ok(())
}

/// Test microphone input with a level meter over the frame source
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let source = build_source(config);
    let spec = source.spec();
    let handle = source.open()?;

    println!("Sample rate: {} Hz, frame: {} samples", spec.sample_rate, spec.frame_length);
    println!("---");

    let frames_per_second = spec.samples_in(Duration::from_secs(1)) / spec.frame_length.max(1);
    let mut second = Vec::with_capacity(spec.sample_rate as usize);

    for i in 0..duration {
        second.clear();
        for _ in 0..frames_per_second.max(1) {
            let frame = source.read(&handle).await?;
            second.extend_from_slice(&frame.samples);
        }

        let energy = frame_energy(&second);
        let peak = second
            .iter()
            .map(|s| f32::from(s.unsigned_abs()) / f32::from(i16::MAX))
            .fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    source.close(&handle);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Set voice.input_device in the config file");

    Ok(())
}

/// Capture one photo and report where it was stored
async fn test_camera(config: &Config) -> anyhow::Result<()> {
    println!("Capturing a photo with {}...", config.camera.program);

    let camera = build_camera(config);
    let capture = tokio::time::timeout(config.timeouts.camera, camera.capture())
        .await
        .map_err(|_| anyhow::anyhow!("camera capture timed out"))??;

    println!(
        "Captured {} bytes to {}",
        capture.image.len(),
        capture.path.display()
    );
    Ok(())
}

/// Synthesize `text` and play it
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let tts = build_tts(config)?;

    println!("Synthesizing speech...");
    let mp3_data = tts.synthesize(text).await?;
    println!("Got {} bytes of audio data", mp3_data.len());

    println!("Playing audio...");
    tokio::task::spawn_blocking(move || AudioPlayback::new()?.play_mp3(&mp3_data)).await??;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

fn history(config: &Config, action: &HistoryAction) -> anyhow::Result<()> {
    let store = JsonHistoryStore::new(&config.history_path);

    match action {
        HistoryAction::Show => {
            let history = ChatHistory::load(&store)?;
            if history.is_empty() {
                println!("No saved conversation at {}", store.path().display());
            }
            for message in history.messages() {
                println!("{}: {}", message.role, message.content);
            }
        }
        HistoryAction::Clear => {
            store.save(&[])?;
            println!("Cleared chat history at {}", store.path().display());
        }
    }

    Ok(())
}
