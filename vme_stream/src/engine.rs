/*!
Per-buffer dispatch from raw controller buffers to output buffers.

The engine owns the parse state of one readout stream, the output side of
the buffer pool and the counters of the run. Raw buffers are handed in one at
a time by the readout thread; `process_buffer` always returns before the next
buffer is accepted.
*/

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::buffer_queue::OutputBuffers;
use crate::counters::{CounterHandle, CounterSnapshot, OutputCounters};
use crate::error::{Result, StreamError};
use crate::frame::{system_event_type_name, SystemEventHeader};
use crate::framed_parser::{parse_readout_buffer, FramedTransport, ReadoutCallbacks, ReadoutParserState};
use crate::legacy::LegacyProcessor;
use crate::protocol::listfile;
use crate::readout_info::ReadoutInfo;
use crate::stream_writer::{StreamWriter, WriterLimits};

/// Controller family and transport a raw buffer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferFormat {
    FramedEth,
    FramedUsb,
    Legacy,
}

impl BufferFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::FramedEth => "framed_eth",
            Self::FramedUsb => "framed_usb",
            Self::Legacy => "legacy",
        }
    }
}

impl fmt::Display for BufferFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BufferFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "framed_eth" | "eth" => Ok(Self::FramedEth),
            "framed_usb" | "usb" => Ok(Self::FramedUsb),
            "legacy" => Ok(Self::Legacy),
            other => Err(StreamError::config(format!("unknown buffer format '{}'", other))),
        }
    }
}

/// One buffer as delivered by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBuffer {
    pub format: BufferFormat,
    pub buffer_number: u32,
    pub data: Bytes,
}

impl RawBuffer {
    pub fn new(format: BufferFormat, buffer_number: u32, data: impl Into<Bytes>) -> Self {
        Self {
            format,
            buffer_number,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub format: BufferFormat,
    pub limits: WriterLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            format: BufferFormat::FramedUsb,
            limits: WriterLimits::default(),
        }
    }
}

enum Processor {
    Framed {
        transport: FramedTransport,
        state: ReadoutParserState,
    },
    Legacy(LegacyProcessor),
}

/// Writes events reassembled by the framed-stack parser into the held
/// output buffer
struct EventWriter<'a> {
    readout: &'a ReadoutInfo,
    writer: &'a mut StreamWriter,
    output: &'a mut OutputBuffers,
    counters: &'a mut OutputCounters,
    module_index: Option<usize>,
}

impl EventWriter<'_> {
    fn close_module(&mut self, event_index: usize) {
        if let Some(mi) = self.module_index.take() {
            let flags = self.writer.close_module_section(self.output.current());
            if flags.module_size_exceeded() {
                warn!("event {}, module {}: module data truncated at the module size limit", event_index, mi);
                self.counters.truncated_modules += 1;
            }
        }
    }
}

impl ReadoutCallbacks for EventWriter<'_> {
    fn begin_event(&mut self, event_index: usize) {
        self.module_index = None;
        self.writer.open_event_section(self.output.current(), event_index as u8);
    }

    fn module_data(&mut self, event_index: usize, module_index: usize, data: &[u32]) {
        if self.module_index != Some(module_index) {
            self.close_module(event_index);

            let type_id = self
                .readout
                .module(event_index, module_index)
                .map_or(0, |m| m.type_id);

            self.writer.open_module_section(self.output.current(), type_id);
            self.module_index = Some(module_index);
        }

        self.writer.write_module_words(self.output.current(), data);
    }

    fn end_event(&mut self, event_index: usize) {
        self.close_module(event_index);

        let buf = self.output.current();
        self.writer.write_event_data(buf, listfile::END_MARKER);
        let flags = self.writer.close_event_section(buf);

        if flags.event_size_exceeded() {
            warn!("event {}: event data truncated at the event size limit", event_index);
            self.counters.truncated_events += 1;
        }
    }

    fn system_event(&mut self, header: &[u32]) {
        if let Some(sys) = header.first().and_then(|&w| SystemEventHeader::from_header(w)) {
            debug!(
                "system event {} (0x{:02x}), {} words",
                system_event_type_name(sys.subtype),
                sys.subtype,
                sys.len
            );
        }
    }
}

/// Reassembles events from one readout stream
pub struct ReadoutEngine {
    config: EngineConfig,
    readout: ReadoutInfo,
    processor: Processor,
    writer: StreamWriter,
    output: OutputBuffers,
    output_counters: OutputCounters,
    snapshot: CounterSnapshot,
    counters: CounterHandle,
}

impl ReadoutEngine {
    pub fn new(config: EngineConfig, readout: ReadoutInfo, output: OutputBuffers) -> Self {
        let processor = match config.format {
            BufferFormat::FramedEth | BufferFormat::FramedUsb => Processor::Framed {
                transport: if config.format == BufferFormat::FramedEth {
                    FramedTransport::Eth
                } else {
                    FramedTransport::Usb
                },
                state: ReadoutParserState::new(&readout),
            },
            BufferFormat::Legacy => Processor::Legacy(LegacyProcessor::new(readout.clone(), config.limits)),
        };

        info!(
            "readout engine: format={}, events={}, max module words={}, max event words={}",
            config.format,
            readout.event_count(),
            config.limits.max_module_words,
            config.limits.max_event_words
        );

        Self {
            config,
            readout,
            processor,
            writer: StreamWriter::new(config.limits),
            output,
            output_counters: OutputCounters::default(),
            snapshot: CounterSnapshot::default(),
            counters: CounterHandle::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared handle readers use to take counter snapshots
    pub fn counter_handle(&self) -> CounterHandle {
        self.counters.clone()
    }

    /// Process one raw buffer. Loss and corrupt input are counted and
    /// recovered from; only a buffer of the wrong format is an error.
    pub fn process_buffer(&mut self, buffer: &RawBuffer) -> Result<()> {
        if buffer.format != self.config.format {
            return Err(StreamError::FormatMismatch {
                buffer_number: buffer.buffer_number,
                found: buffer.format,
                expected: self.config.format,
            });
        }

        trace!(
            "processing {} buffer {}, {} bytes",
            buffer.format,
            buffer.buffer_number,
            buffer.data.len()
        );

        match &mut self.processor {
            Processor::Framed { transport, state } => {
                let mut sink = EventWriter {
                    readout: &self.readout,
                    writer: &mut self.writer,
                    output: &mut self.output,
                    counters: &mut self.output_counters,
                    module_index: None,
                };

                match parse_readout_buffer(*transport, state, &mut sink, buffer.buffer_number, &buffer.data) {
                    Ok(pr) if !pr.is_ok() => {
                        debug!("buffer {}: {}", buffer.buffer_number, pr);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("buffer {}: {}", buffer.buffer_number, e);
                    }
                }

                // Events are written whole, nothing is left open here.
                self.output.flush_if_not_empty();
            }

            Processor::Legacy(legacy) => {
                if let Err(e) = legacy.process_buffer(buffer.buffer_number, &buffer.data, &mut self.output) {
                    debug!("buffer {}: {}", buffer.buffer_number, e);
                }
            }
        }

        self.publish_counters();
        Ok(())
    }

    /// Discard any partial event, deliver the completed events still held in
    /// the output buffer and reset the parse state. Counters are kept and
    /// published.
    pub fn stop(&mut self) {
        match &mut self.processor {
            Processor::Framed { state, .. } => {
                if state.is_event_in_progress() {
                    debug!("discarding event in progress at stop");
                }
                state.reset();
            }
            Processor::Legacy(legacy) => {
                if legacy.is_event_in_progress() {
                    debug!("discarding continued event at stop");
                }
                legacy.reset(&mut self.output);
            }
        }

        self.writer.reset();
        self.output.flush_if_not_empty();

        self.update_snapshot();
        self.counters.publish(&self.snapshot);
    }

    /// Current counters of the run
    pub fn snapshot(&mut self) -> CounterSnapshot {
        self.update_snapshot();
        self.snapshot.clone()
    }

    fn update_snapshot(&mut self) {
        match &self.processor {
            Processor::Framed { state, .. } => self.snapshot.parser.clone_from(&state.counters),
            Processor::Legacy(legacy) => self.snapshot.legacy.clone_from(&legacy.counters),
        }

        self.snapshot.output = OutputCounters {
            buffers_flushed: self.output.buffers_flushed(),
            bytes_flushed: self.output.bytes_flushed(),
            dropped_buffers: self.output.dropped_buffers(),
            ..self.output_counters.clone()
        };
    }

    /// Publish counters without waiting for readers. Returns false if the
    /// handle was busy; the next buffer publishes again.
    fn publish_counters(&mut self) -> bool {
        self.update_snapshot();
        self.counters.try_publish(&self.snapshot)
    }
}
