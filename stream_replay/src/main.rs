/*!
# Stream Replay Application

Headless driver for the readout reassembly engine. Recorded (or synthetic)
raw controller buffers are fed through the engine on a readout thread and the
reassembled events are written to a listfile.

## Features

- Replay of capture files in framed USB, framed ETH or legacy format
- Bounded output buffer queue with a separate listfile writer thread
- Periodic and final counter reports, optionally as JSON
- Deterministic synthetic data generation with simulated buffer loss

## Usage

### Generate a configuration template
```bash
stream_replay config --output stream_replay.toml
```

### Generate synthetic data
```bash
stream_replay synth --output run.capture --events 100000 --format framed_usb
```

### Replay a capture file
```bash
stream_replay --config stream_replay.toml replay run.capture
```
*/

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod replay;
mod synth;

use capture::CaptureWriter;
use config::AppConfig;
use replay::ReplaySession;
use synth::SynthOptions;
use vme_stream::BufferFormat;

#[derive(Parser)]
#[command(name = "stream_replay")]
#[command(about = "Replay recorded VME controller buffers through the readout reassembly engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "stream_replay.toml", global = true)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a capture file
    Replay {
        /// Capture file to replay
        input: PathBuf,

        /// Override the buffer format from the configuration
        #[arg(short, long)]
        format: Option<BufferFormat>,

        /// Override the listfile output directory
        #[arg(short, long)]
        output_dir: Option<String>,

        /// Do not write a listfile
        #[arg(long)]
        no_storage: bool,

        /// Print the final counters as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate a synthetic capture file for the configured readout
    Synth {
        /// Output capture file
        #[arg(short, long, default_value = "synthetic.capture")]
        output: PathBuf,

        /// Buffer format to generate
        #[arg(short, long, default_value = "framed_usb")]
        format: BufferFormat,

        /// Number of events
        #[arg(short, long, default_value = "10000")]
        events: u64,

        /// Maximum size of each buffer in bytes
        #[arg(long, default_value = "16384")]
        buffer_size: usize,

        /// Maximum length of block reads in words
        #[arg(long, default_value = "100")]
        max_dynamic: u32,

        /// Insert a timestamp system event every n events (0 = never)
        #[arg(long, default_value = "100")]
        timestamp_every: u64,

        /// Drop every n-th buffer to simulate loss (0 = never)
        #[arg(long, default_value = "0")]
        drop_every: u64,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "stream_replay.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr, reports to stdout
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            input,
            format,
            output_dir,
            no_storage,
            json,
        } => {
            let mut config = load_config(&cli.config)?;

            if let Some(format) = format {
                config.replay.format = format;
            }
            if let Some(dir) = output_dir {
                config.replay.output_directory = dir;
            }
            if no_storage {
                config.replay.enable_storage = false;
            }

            run_replay(config, input, json)
        }

        Commands::Synth {
            output,
            format,
            events,
            buffer_size,
            max_dynamic,
            timestamp_every,
            drop_every,
        } => {
            let config = load_config(&cli.config)?;
            let options = SynthOptions {
                format,
                buffer_bytes: buffer_size,
                events,
                max_dynamic_words: max_dynamic,
                timestamp_every,
                drop_every,
            };

            run_synth(&config, &options, output)
        }

        Commands::Config { output } => generate_config_file(output),
    }
}

/// Load the configuration file, falling back to defaults if it is missing
fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load_from_file(path)
    } else {
        eprintln!("⚠️ Config file {} not found, using defaults", path.display());
        Ok(AppConfig::new())
    }
}

/// Replay a capture file through the engine
fn run_replay(config: AppConfig, input: PathBuf, json: bool) -> Result<()> {
    // Keep stdout clean for JSON output
    if !json {
        println!("🚀 Starting replay of {}", input.display());
        println!("📦 Format: {}", config.replay.format);
        println!(
            "🔧 Queue depth: {}, output buffers: {} bytes",
            config.replay.queue_depth, config.replay.output_buffer_size
        );
    }

    let session = ReplaySession::new(config, input);

    if let (false, Some(path)) = (json, session.listfile_path()) {
        println!("💾 Writing listfile to {}", path.display());
    }

    // Set up Ctrl+C handler
    let running = session.get_running_flag();
    ctrlc::set_handler(move || {
        println!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    let summary = session.run().context("Replay failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        replay::print_summary(&summary);
        println!("✅ Replay completed");
    }
    Ok(())
}

/// Write synthetic buffers for the configured readout to a capture file
fn run_synth(config: &AppConfig, options: &SynthOptions, output: PathBuf) -> Result<()> {
    let readout = config.readout_info()?;

    println!("🧪 Generating {} {} events", options.events, options.format);

    let mut writer = CaptureWriter::create(&output)?;
    let stats = synth::generate(&readout, options, |buffer_number, data| {
        writer.write_buffer(buffer_number, data)
    })?;
    writer.finish()?;

    println!(
        "✅ Wrote {} buffers ({} bytes) to {}",
        stats.buffers_written,
        stats.bytes_written,
        output.display()
    );
    if stats.buffers_dropped > 0 {
        println!("📉 Dropped {} buffers", stats.buffers_dropped);
    }

    println!("📝 Replay it with:");
    println!("   stream_replay replay --format {} {}", options.format, output.display());

    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   stream_replay --config {} replay <capture file>", output_path.display());

    Ok(())
}
