/*!
Replay pipeline.

Feeds a capture file through the readout engine the way a live readout
would:

1. Reader thread: capture file records -> bounded raw buffer channel
2. Readout thread: raw buffers -> [`ReadoutEngine`] -> filled output buffers
3. Listfile thread: filled output buffers -> section validation -> listfile

The main thread reports counters periodically until the readout thread is
done. Each replay session writes its listfile with a timestamped name.
*/

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use vme_stream::protocol::listfile;
use vme_stream::{
    BufferFormat, BufferQueues, CounterHandle, CounterSnapshot, FilledBuffers, RawBuffer, ReadoutEngine, SectionIter,
};

use crate::capture::CaptureReader;
use crate::config::AppConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes shown when dumping an invalid output section
const DUMP_BYTES: usize = 32;

/// What the listfile thread saw
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListfileStats {
    pub buffers_received: u64,
    pub bytes_received: u64,
    pub events_received: u64,
    pub invalid_sections: u64,
    pub bytes_written: u64,
}

/// Final report of a replay session
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub format: BufferFormat,
    pub input: String,
    pub listfile: Option<String>,
    pub buffers_read: u64,
    pub bytes_read: u64,
    pub elapsed_seconds: f64,
    pub counters: CounterSnapshot,
    pub listfile_stats: ListfileStats,
}

/// One replay of a capture file
pub struct ReplaySession {
    config: AppConfig,
    input: PathBuf,
    listfile_path: Option<PathBuf>,
    running: Arc<AtomicBool>,
}

impl ReplaySession {
    /// Create a session. The listfile name is fixed here so that it can be
    /// reported before the replay starts.
    pub fn new(config: AppConfig, input: PathBuf) -> Self {
        let listfile_path = config.replay.enable_storage.then(|| {
            let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
            Path::new(&config.replay.output_directory).join(format!(
                "replay_{}_{}.listfile",
                timestamp, config.replay.format
            ))
        });

        if let Some(path) = &listfile_path {
            info!("📁 Listfile will be written to: {}", path.display());
        }

        Self {
            config,
            input,
            listfile_path,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Get a reference to the running flag for external control
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn listfile_path(&self) -> Option<&Path> {
        self.listfile_path.as_deref()
    }

    /// Run the replay to completion or until the running flag is cleared
    pub fn run(&self) -> Result<ReplaySummary> {
        let started = Instant::now();
        let replay = &self.config.replay;
        let format = replay.format;

        // Layout errors surface before any data is read.
        let readout = self.config.readout_info()?;
        let reader = CaptureReader::open(&self.input)?;

        let listfile = match &self.listfile_path {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)
                        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
                }
                let file = File::create(path)
                    .with_context(|| format!("Failed to create listfile: {}", path.display()))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        let (output, filled) =
            BufferQueues::new(replay.queue_depth, replay.output_buffer_size, replay.free_buffer_timeout()).split();
        let engine = ReadoutEngine::new(self.config.engine_config(), readout, output);
        let counters = engine.counter_handle();

        let (raw_tx, raw_rx) = bounded::<RawBuffer>(replay.queue_depth.max(1));

        let running_reader = Arc::clone(&self.running);
        let running_readout = Arc::clone(&self.running);

        let reader_handle = thread::spawn(move || match reader_thread(reader, format, raw_tx, running_reader) {
            Ok(totals) => {
                info!("Reader thread finished successfully");
                Ok(totals)
            }
            Err(e) => {
                error!("Reader thread failed: {:#}", e);
                Err(e)
            }
        });

        let readout_handle = thread::spawn(move || match readout_thread(engine, raw_rx, running_readout) {
            Ok(snapshot) => {
                info!("Readout thread finished successfully");
                Ok(snapshot)
            }
            Err(e) => {
                error!("Readout thread failed: {:#}", e);
                Err(e)
            }
        });

        let listfile_handle = thread::spawn(move || match listfile_thread(filled, listfile) {
            Ok(stats) => {
                info!("Listfile thread finished successfully");
                Ok(stats)
            }
            Err(e) => {
                error!("Listfile thread failed: {:#}", e);
                Err(e)
            }
        });

        self.monitor(&counters, &readout_handle, started);

        let readout_result = readout_handle
            .join()
            .map_err(|_| anyhow!("readout thread panicked"))?;

        // Ends once the readout thread has dropped its receiver.
        let (buffers_read, bytes_read) = reader_handle
            .join()
            .map_err(|_| anyhow!("reader thread panicked"))??;

        let listfile_stats = listfile_handle
            .join()
            .map_err(|_| anyhow!("listfile thread panicked"))??;

        let counters = readout_result?;

        Ok(ReplaySummary {
            format,
            input: self.input.display().to_string(),
            listfile: self.listfile_path.as_ref().map(|p| p.display().to_string()),
            buffers_read,
            bytes_read,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            counters,
            listfile_stats,
        })
    }

    /// Log counters every stats interval until the readout thread is done
    fn monitor<T>(&self, counters: &CounterHandle, readout: &thread::JoinHandle<T>, started: Instant) {
        let interval = Duration::from_secs(self.config.replay.stats_interval_seconds.max(1));
        let mut last_report = Instant::now();

        while !readout.is_finished() {
            thread::sleep(POLL_INTERVAL);

            if last_report.elapsed() >= interval {
                log_stats(&counters.snapshot(), started.elapsed());
                last_report = Instant::now();
            }
        }
    }
}

fn reader_thread<R: std::io::Read>(
    reader: CaptureReader<R>,
    format: BufferFormat,
    raw_tx: Sender<RawBuffer>,
    running: Arc<AtomicBool>,
) -> Result<(u64, u64)> {
    let mut buffers = 0u64;
    let mut bytes = 0u64;

    for record in reader {
        if !running.load(Ordering::SeqCst) {
            info!("Reader stopping, {} buffers read", buffers);
            break;
        }

        let (buffer_number, data) = record?;
        bytes += data.len() as u64;
        buffers += 1;

        if raw_tx.send(RawBuffer::new(format, buffer_number, data)).is_err() {
            debug!("readout side closed, stopping reader");
            break;
        }
    }

    Ok((buffers, bytes))
}

/// Hands raw buffers to the engine one at a time. Stop requests take effect
/// between buffers.
fn readout_thread(
    mut engine: ReadoutEngine,
    raw_rx: Receiver<RawBuffer>,
    running: Arc<AtomicBool>,
) -> Result<CounterSnapshot> {
    let outcome = loop {
        if !running.load(Ordering::SeqCst) {
            info!("🛑 Stop requested, ending readout");
            break Ok(());
        }

        match raw_rx.recv_timeout(POLL_INTERVAL) {
            Ok(buffer) => {
                if let Err(e) = engine.process_buffer(&buffer) {
                    break Err(e);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };

    // Partial events are discarded, never flushed.
    engine.stop();
    let snapshot = engine.snapshot();

    outcome.context("Readout aborted")?;
    Ok(snapshot)
}

fn listfile_thread(filled: FilledBuffers, mut listfile: Option<BufWriter<File>>) -> Result<ListfileStats> {
    let mut stats = ListfileStats::default();

    loop {
        let buffer = match filled.recv_timeout(POLL_INTERVAL) {
            Ok(buffer) => buffer,
            Err(RecvTimeoutError::Timeout) => continue,
            // The engine is gone and every filled buffer was consumed.
            Err(RecvTimeoutError::Disconnected) => break,
        };

        stats.buffers_received += 1;
        stats.bytes_received += buffer.len() as u64;

        for section in SectionIter::new(buffer.as_bytes()) {
            match section {
                Ok(section) if section.section_type as u32 == listfile::SECTION_EVENT => {
                    stats.events_received += 1;
                }
                Ok(section) => {
                    debug!(
                        "non-event section type {} in output buffer {}",
                        section.section_type, stats.buffers_received
                    );
                }
                Err(e) => {
                    let dump = &buffer.as_bytes()[..buffer.len().min(DUMP_BYTES)];
                    warn!("{} (buffer starts with {})", e, hex::encode(dump));
                    stats.invalid_sections += 1;
                }
            }
        }

        if let Some(out) = listfile.as_mut() {
            out.write_all(buffer.as_bytes()).context("Failed to write listfile")?;
            stats.bytes_written += buffer.len() as u64;
        }

        filled.recycle(buffer);
    }

    if let Some(mut out) = listfile {
        out.flush().context("Failed to flush listfile")?;
    }

    Ok(stats)
}

fn log_stats(counters: &CounterSnapshot, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let events = counters.parser.events_completed + counters.legacy.events_written;

    info!("📊 Replay Statistics ({:.1}s elapsed):", elapsed.as_secs_f64());
    info!("   Events: {} ({:.0} events/s)", events, events as f64 / secs);
    info!(
        "   Output: {} buffers, {:.1} MB, {} dropped",
        counters.output.buffers_flushed,
        counters.output.bytes_flushed as f64 / 1_000_000.0,
        counters.output.dropped_buffers
    );
    info!(
        "   Loss: {} buffers, {} packets",
        counters.parser.internal_buffer_loss + counters.legacy.internal_buffer_loss,
        counters.parser.eth_packet_loss
    );
}

/// Print the final report of a session
pub fn print_summary(summary: &ReplaySummary) {
    let c = &summary.counters;
    let secs = summary.elapsed_seconds.max(f64::EPSILON);

    println!("📊 Replay summary ({}):", summary.format);
    println!("   Input: {} ({} buffers, {} bytes)", summary.input, summary.buffers_read, summary.bytes_read);
    println!(
        "   Throughput: {:.1} MB/s",
        summary.bytes_read as f64 / 1_000_000.0 / secs
    );

    match summary.format {
        BufferFormat::FramedEth | BufferFormat::FramedUsb => {
            println!("   Events completed: {}", c.parser.events_completed);
            println!("   Buffer loss: {}", c.parser.internal_buffer_loss);
            if summary.format == BufferFormat::FramedEth {
                println!(
                    "   Packets: {} processed, {} lost",
                    c.parser.eth_packets_processed, c.parser.eth_packet_loss
                );
            }
            println!("   Parse errors: {}", c.parser.parse_errors());
            println!("   Unused bytes: {}", c.parser.unused_bytes);
        }
        BufferFormat::Legacy => {
            println!("   Events written: {}", c.legacy.events_written);
            println!("   Buffer loss: {}", c.legacy.internal_buffer_loss);
            println!("   Buffers with errors: {}", c.legacy.buffers_with_errors);
            println!("   Unmapped stack records: {}", c.legacy.unmapped_stack_events);
            println!("   Unused bytes: {}", c.legacy.unused_bytes);
        }
    }

    println!(
        "   Output: {} buffers, {} bytes, {} dropped",
        c.output.buffers_flushed, c.output.bytes_flushed, c.output.dropped_buffers
    );
    println!(
        "   Listfile: {} events, {} invalid sections",
        summary.listfile_stats.events_received, summary.listfile_stats.invalid_sections
    );

    if let Some(path) = &summary.listfile {
        println!("💾 Listfile: {} ({} bytes)", path, summary.listfile_stats.bytes_written);
    }
}
