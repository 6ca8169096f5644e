/*!
Deterministic synthetic readout data.

Builds raw controller buffers for a configured readout layout so that the
replay pipeline can be exercised without hardware. Every format the engine
accepts can be produced:

- framed USB: a continuous frame stream cut into fixed-size buffers, frames
  freely spanning buffer boundaries except for system events
- framed ETH: the same frame stream packed into numbered packets with payload
  headers, several packets per buffer
- legacy: 16-bit event records, large events split into continuation records
  so that 32-bit words may be cut in half at a buffer boundary

Buffer loss can be simulated by skipping every n-th buffer number.
*/

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info};

use vme_stream::frame::{make_frame_header, FrameType, PayloadHeader, SystemEventHeader};
use vme_stream::protocol::{eth, frame, legacy, listfile, system_event};
use vme_stream::{BufferFormat, ModuleReadoutInfo, ReadoutInfo};

/// Words per stack frame before a continuation frame is started
const MAX_STACK_FRAME_WORDS: usize = 256;

/// Words per block read frame before a continued block frame is started
const MAX_BLOCK_FRAME_WORDS: usize = 64;

/// Payload words per Ethernet packet, roughly one MTU
const ETH_PACKET_DATA_WORDS: usize = 360;

const TIMESTAMP_EPOCH: u64 = 1_700_000_000;

#[derive(Debug, Clone)]
pub struct SynthOptions {
    pub format: BufferFormat,
    /// Upper bound for the size of each generated buffer
    pub buffer_bytes: usize,
    pub events: u64,
    /// Upper bound for the length of each block read
    pub max_dynamic_words: u32,
    /// Insert a timestamp system event every n events, 0 disables them
    pub timestamp_every: u64,
    /// Skip every n-th buffer number, 0 disables loss
    pub drop_every: u64,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            format: BufferFormat::FramedUsb,
            buffer_bytes: 16 * 1024,
            events: 1000,
            max_dynamic_words: 100,
            timestamp_every: 100,
            drop_every: 0,
        }
    }
}

impl SynthOptions {
    /// Smallest buffer able to hold any frame or record header sequence
    pub fn min_buffer_bytes(format: BufferFormat) -> usize {
        match format {
            BufferFormat::FramedUsb => 64,
            BufferFormat::FramedEth => (eth::HEADER_WORDS + ETH_PACKET_DATA_WORDS + 4) * 4,
            BufferFormat::Legacy => 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SynthStats {
    pub events_generated: u64,
    pub buffers_written: u64,
    pub buffers_dropped: u64,
    pub bytes_written: u64,
}

/// Numbers buffers, applies simulated loss and hands the survivors to the sink
struct Emitter<F> {
    sink: F,
    next_number: u32,
    drop_every: u64,
    stats: SynthStats,
}

impl<F> Emitter<F>
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    fn new(sink: F, drop_every: u64) -> Self {
        Self {
            sink,
            next_number: 1,
            drop_every,
            stats: SynthStats::default(),
        }
    }

    fn emit_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let number = self.next_number;
        self.next_number = number.wrapping_add(1);

        if self.drop_every != 0 && number as u64 % self.drop_every == 0 {
            debug!("dropping buffer {} ({} bytes)", number, bytes.len());
            self.stats.buffers_dropped += 1;
            return Ok(());
        }

        (self.sink)(number, bytes)?;
        self.stats.buffers_written += 1;
        self.stats.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn emit_u32(&mut self, words: &[u32]) -> Result<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.emit_bytes(&bytes)
    }

    fn emit_u16(&mut self, words: &[u16]) -> Result<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.emit_bytes(&bytes)
    }
}

/// Readout words of one module
struct ModuleData {
    prefix: Vec<u32>,
    dynamic: Option<Vec<u32>>,
    suffix: Vec<u32>,
}

impl ModuleData {
    fn generate(layout: ModuleReadoutInfo, ei: usize, mi: usize, event_number: u64, max_dynamic: u32) -> Self {
        let mut k = 0u32;
        let mut next = || {
            let word = data_word(ei, mi, event_number, k);
            k += 1;
            word
        };

        let prefix: Vec<u32> = (0..layout.prefix_len).map(|_| next()).collect();

        let dynamic: Option<Vec<u32>> = layout.has_dynamic.then(|| {
            let len = (event_number * 7 + mi as u64 * 13 + ei as u64 * 3) % (max_dynamic as u64 + 1);
            (0..len).map(|_| next()).collect()
        });

        let suffix: Vec<u32> = (0..layout.suffix_len).map(|_| next()).collect();

        Self { prefix, dynamic, suffix }
    }

    fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.prefix
            .iter()
            .chain(self.dynamic.iter().flatten())
            .chain(self.suffix.iter())
            .copied()
    }
}

/// Data word tagged with its origin. The top nibble stays below 8 so that
/// no data word equals the module end marker.
fn data_word(ei: usize, mi: usize, event_number: u64, k: u32) -> u32 {
    ((ei as u32 & 0x7) << 28) | ((mi as u32 & 0xf) << 24) | ((event_number as u32 & 0xfff) << 12) | (k & 0xfff)
}

fn event_data(readout: &ReadoutInfo, ei: usize, event_number: u64, max_dynamic: u32) -> Vec<ModuleData> {
    readout
        .modules(ei)
        .iter()
        .enumerate()
        .map(|(mi, m)| ModuleData::generate(m.readout, ei, mi, event_number, max_dynamic))
        .collect()
}

/// Pieces of a stack frame body. Block frames are never split between stack
/// frames.
enum Piece {
    Word(u32),
    Block(Vec<u32>),
}

impl Piece {
    fn len(&self) -> usize {
        match self {
            Piece::Word(_) => 1,
            Piece::Block(words) => words.len(),
        }
    }
}

/// Top-level frames (stack frame plus continuations) of one event, each
/// including its header word
fn framed_event(event_index: usize, modules: &[ModuleData]) -> Vec<Vec<u32>> {
    let mut pieces = Vec::new();

    for module in modules {
        pieces.extend(module.prefix.iter().map(|w| Piece::Word(*w)));

        if let Some(dynamic) = &module.dynamic {
            let chunks: Vec<&[u32]> = if dynamic.is_empty() {
                vec![&dynamic[..]]
            } else {
                dynamic.chunks(MAX_BLOCK_FRAME_WORDS).collect()
            };

            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let flags = if i < last { frame::FLAG_CONTINUE } else { 0 };
                let mut block = Vec::with_capacity(chunk.len() + 1);
                block.push(make_frame_header(FrameType::BlockRead, flags, 0, chunk.len() as u16));
                block.extend_from_slice(chunk);
                pieces.push(Piece::Block(block));
            }
        }

        pieces.extend(module.suffix.iter().map(|w| Piece::Word(*w)));
    }

    let mut bodies: Vec<Vec<u32>> = vec![Vec::new()];
    for piece in pieces {
        let full = bodies
            .last()
            .is_some_and(|body| !body.is_empty() && body.len() + piece.len() > MAX_STACK_FRAME_WORDS);
        if full {
            bodies.push(Vec::new());
        }

        if let Some(body) = bodies.last_mut() {
            match piece {
                Piece::Word(w) => body.push(w),
                Piece::Block(words) => body.extend(words),
            }
        }
    }

    let stack = (event_index + 1) as u8;
    let last = bodies.len() - 1;

    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| {
            let frame_type = if i == 0 {
                FrameType::StackFrame
            } else {
                FrameType::StackContinuation
            };
            let flags = if i < last { frame::FLAG_CONTINUE } else { 0 };

            let mut words = Vec::with_capacity(body.len() + 1);
            words.push(make_frame_header(frame_type, flags, stack, body.len() as u16));
            words.extend(body);
            words
        })
        .collect()
}

fn system_event_frame(subtype: u8, payload: &[u32]) -> Vec<u32> {
    let header = SystemEventHeader {
        subtype,
        continued: false,
        len: payload.len() as u16,
    };

    let mut words = vec![header.to_header()];
    words.extend_from_slice(payload);
    words
}

fn timestamp_frame(event_number: u64) -> Vec<u32> {
    let seconds = TIMESTAMP_EPOCH + event_number / 1000;
    system_event_frame(system_event::UNIX_TIMESTAMP, &[seconds as u32, (seconds >> 32) as u32])
}

/// Generate buffers for `options.events` events, cycling through the
/// configured events, and pass each surviving buffer to `sink`.
pub fn generate<F>(readout: &ReadoutInfo, options: &SynthOptions, sink: F) -> Result<SynthStats>
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    if readout.event_count() == 0 {
        bail!("no events configured");
    }

    let min_bytes = SynthOptions::min_buffer_bytes(options.format);
    if options.buffer_bytes < min_bytes {
        bail!(
            "buffer size {} is below the {} byte minimum for {} data",
            options.buffer_bytes,
            min_bytes,
            options.format
        );
    }

    info!(
        "🧪 Generating {} events as {} buffers of up to {} bytes",
        options.events, options.format, options.buffer_bytes
    );

    let mut emitter = Emitter::new(sink, options.drop_every);

    let events = match options.format {
        BufferFormat::FramedUsb => generate_usb(readout, options, &mut emitter)?,
        BufferFormat::FramedEth => generate_eth(readout, options, &mut emitter)?,
        BufferFormat::Legacy => generate_legacy(readout, options, &mut emitter)?,
    };

    emitter.stats.events_generated = events;
    Ok(emitter.stats)
}

fn wants_timestamp(options: &SynthOptions, event_number: u64) -> bool {
    options.timestamp_every != 0 && event_number % options.timestamp_every == 0
}

fn generate_usb<F>(readout: &ReadoutInfo, options: &SynthOptions, out: &mut Emitter<F>) -> Result<u64>
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    let capacity = options.buffer_bytes / 4;
    let mut buffer: Vec<u32> = Vec::with_capacity(capacity);

    for event_number in 0..options.events {
        if wants_timestamp(options, event_number) {
            push_whole(out, &mut buffer, capacity, &timestamp_frame(event_number))?;
        }

        let ei = (event_number % readout.event_count() as u64) as usize;
        let modules = event_data(readout, ei, event_number, options.max_dynamic_words);

        for word in framed_event(ei, &modules).into_iter().flatten() {
            buffer.push(word);
            if buffer.len() == capacity {
                out.emit_u32(&buffer)?;
                buffer.clear();
            }
        }
    }

    push_whole(out, &mut buffer, capacity, &system_event_frame(system_event::END_OF_FILE, &[]))?;

    if !buffer.is_empty() {
        out.emit_u32(&buffer)?;
    }

    Ok(options.events)
}

/// Append a frame that must not be split, starting a new buffer if needed.
/// System events have to be contained in a single buffer.
fn push_whole<F>(out: &mut Emitter<F>, buffer: &mut Vec<u32>, capacity: usize, words: &[u32]) -> Result<()>
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    if buffer.len() + words.len() > capacity {
        out.emit_u32(buffer)?;
        buffer.clear();
    }
    buffer.extend_from_slice(words);
    Ok(())
}

/// Packs a frame stream into Ethernet packets and packets into buffers
struct EthPacker {
    buffer_words: usize,
    buffer: Vec<u32>,
    payload: Vec<u32>,
    first_header: Option<usize>,
    packet_number: u16,
}

impl EthPacker {
    fn new(buffer_words: usize) -> Self {
        Self {
            buffer_words,
            buffer: Vec::with_capacity(buffer_words),
            payload: Vec::with_capacity(ETH_PACKET_DATA_WORDS),
            first_header: None,
            packet_number: 0,
        }
    }

    fn push_frame<F>(&mut self, words: &[u32], out: &mut Emitter<F>) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        for (i, word) in words.iter().enumerate() {
            if i == 0 && self.first_header.is_none() {
                self.first_header = Some(self.payload.len());
            }

            self.payload.push(*word);

            if self.payload.len() == ETH_PACKET_DATA_WORDS {
                self.finish_packet(out)?;
            }
        }
        Ok(())
    }

    fn finish_packet<F>(&mut self, out: &mut Emitter<F>) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        if self.payload.is_empty() {
            return Ok(());
        }

        let pointer = self
            .first_header
            .map_or(eth::NO_HEADER_POINTER_PRESENT, |offset| offset as u16);
        let header = PayloadHeader::encode(
            eth::CHANNEL_DATA,
            self.packet_number,
            self.payload.len() as u16,
            pointer,
        );
        self.packet_number = (self.packet_number + 1) & eth::PACKET_NUMBER_MASK as u16;

        let packet_words = eth::HEADER_WORDS + self.payload.len();
        if self.buffer.len() + packet_words > self.buffer_words {
            self.emit_buffer(out)?;
        }

        self.buffer.push(header.header0);
        self.buffer.push(header.header1);
        self.buffer.append(&mut self.payload);
        self.first_header = None;
        Ok(())
    }

    /// System events sit between packets
    fn push_system_event<F>(&mut self, words: &[u32], out: &mut Emitter<F>) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        self.finish_packet(out)?;

        if self.buffer.len() + words.len() > self.buffer_words {
            self.emit_buffer(out)?;
        }
        self.buffer.extend_from_slice(words);
        Ok(())
    }

    fn emit_buffer<F>(&mut self, out: &mut Emitter<F>) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        if !self.buffer.is_empty() {
            out.emit_u32(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }
}

fn generate_eth<F>(readout: &ReadoutInfo, options: &SynthOptions, out: &mut Emitter<F>) -> Result<u64>
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    let mut packer = EthPacker::new(options.buffer_bytes / 4);

    for event_number in 0..options.events {
        if wants_timestamp(options, event_number) {
            packer.push_system_event(&timestamp_frame(event_number), out)?;
        }

        let ei = (event_number % readout.event_count() as u64) as usize;
        let modules = event_data(readout, ei, event_number, options.max_dynamic_words);

        for frame_words in framed_event(ei, &modules) {
            packer.push_frame(&frame_words, out)?;
        }
    }

    packer.push_system_event(&system_event_frame(system_event::END_OF_FILE, &[]), out)?;
    packer.emit_buffer(out)?;

    Ok(options.events)
}

/// Module data of one event as 16-bit words, low half first. Every module
/// ends with the end marker.
fn legacy_event(modules: &[ModuleData]) -> Vec<u16> {
    modules
        .iter()
        .flat_map(|m| m.words().chain(std::iter::once(listfile::END_MARKER)))
        .flat_map(|w| [w as u16, (w >> 16) as u16])
        .collect()
}

/// Packs event records into legacy buffers
struct LegacyPacker {
    capacity: usize,
    records: Vec<u16>,
    record_count: u16,
}

impl LegacyPacker {
    /// Buffer header plus two terminator words
    const OVERHEAD: usize = 3;

    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Vec::with_capacity(capacity),
            record_count: 0,
        }
    }

    /// Data words the current buffer takes after one more record header,
    /// `None` if not even the header fits
    fn room(&self) -> Option<usize> {
        self.capacity
            .checked_sub(Self::OVERHEAD + self.records.len() + 1)
            .map(|room| room.min(legacy::EVENT_LENGTH_MASK as usize))
    }

    fn push_event<F>(&mut self, stack_id: u8, mut data: &[u16], out: &mut Emitter<F>) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        loop {
            // Records carry at least one full 32-bit value unless the event
            // is shorter. An empty buffer always has room for that.
            let wanted = data.len().min(2);
            if !matches!(self.room(), Some(room) if room >= wanted) {
                self.emit_buffer(out)?;
            }

            let take = data.len().min(self.room().unwrap_or(0));
            let partial = take < data.len();
            let continuation = if partial { legacy::EVENT_CONTINUATION } else { 0 };

            let header = ((stack_id as u16 & legacy::EVENT_STACK_ID_MASK) << legacy::EVENT_STACK_ID_SHIFT)
                | continuation
                | take as u16;

            self.records.push(header);
            self.records.extend_from_slice(&data[..take]);
            self.record_count += 1;
            data = &data[take..];

            if !partial {
                return Ok(());
            }

            // A continued record is always the last one of its buffer.
            self.emit_buffer(out)?;
        }
    }

    fn emit_buffer<F>(&mut self, out: &mut Emitter<F>) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        if self.record_count == 0 {
            return Ok(());
        }

        let mut words = Vec::with_capacity(self.records.len() + Self::OVERHEAD);
        words.push(self.record_count & legacy::BUFFER_EVENT_COUNT_MASK);
        words.append(&mut self.records);
        words.extend_from_slice(&[legacy::BUFFER_TERMINATOR, legacy::BUFFER_TERMINATOR]);

        self.record_count = 0;
        out.emit_u16(&words)
    }
}

fn generate_legacy<F>(readout: &ReadoutInfo, options: &SynthOptions, out: &mut Emitter<F>) -> Result<u64>
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    // Only events with a stack id can be read out by a legacy controller.
    let stacks: Vec<(usize, u8)> = (0..=legacy::STACK_ID_MAX)
        .filter_map(|stack_id| readout.event_for_stack(stack_id).map(|ei| (ei, stack_id)))
        .collect();

    if stacks.is_empty() {
        bail!("no event has a legacy stack id");
    }

    let mut packer = LegacyPacker::new(options.buffer_bytes / 2);

    for event_number in 0..options.events {
        let (ei, stack_id) = stacks[(event_number % stacks.len() as u64) as usize];
        let modules = event_data(readout, ei, event_number, options.max_dynamic_words);
        packer.push_event(stack_id, &legacy_event(&modules), out)?;
    }

    packer.emit_buffer(out)?;
    Ok(options.events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vme_stream::{
        BufferQueues, EngineConfig, EventConfig, ModuleConfig, RawBuffer, ReadoutCommand, ReadoutEngine, SectionIter,
        WriterLimits,
    };

    fn readout() -> ReadoutInfo {
        let module = |name: &str, type_id: u8, readout: Vec<ReadoutCommand>| ModuleConfig {
            name: name.to_string(),
            type_id,
            readout,
        };
        let read = ReadoutCommand::Read { address: 0x6030 };
        let block = ReadoutCommand::BlockRead {
            address: 0,
            max_transfers: 0,
        };

        ReadoutInfo::build(&[
            EventConfig {
                name: "trigger".to_string(),
                stack_id: Some(1),
                modules: vec![
                    module("adc", 3, vec![read.clone(), block.clone(), read.clone()]),
                    module("tdc", 4, vec![block.clone()]),
                ],
            },
            EventConfig {
                name: "scaler".to_string(),
                stack_id: Some(4),
                modules: vec![module("counter", 5, vec![read.clone(), read])],
            },
        ])
        .unwrap()
    }

    fn generate_buffers(options: &SynthOptions) -> (SynthStats, Vec<RawBuffer>) {
        let mut buffers = Vec::new();
        let stats = generate(&readout(), options, |n, data| {
            buffers.push(RawBuffer::new(options.format, n, data.to_vec()));
            Ok(())
        })
        .unwrap();
        (stats, buffers)
    }

    /// Replay buffers through an engine and count the event sections received
    fn replay(format: BufferFormat, buffers: &[RawBuffer]) -> (u64, ReadoutEngine) {
        let (output, filled) = BufferQueues::new(4, 64 * 1024, Duration::from_millis(5)).split();
        let config = EngineConfig {
            format,
            limits: WriterLimits::default(),
        };
        let mut engine = ReadoutEngine::new(config, readout(), output);
        let mut sections = 0;

        for buffer in buffers {
            engine.process_buffer(buffer).unwrap();

            while let Some(out) = filled.try_recv() {
                for section in SectionIter::new(out.as_bytes()) {
                    let section = section.unwrap();
                    assert_eq!(section.section_type as u32, listfile::SECTION_EVENT);
                    assert!(section.modules().is_ok());
                    sections += 1;
                }
                filled.recycle(out);
            }
        }

        (sections, engine)
    }

    fn record_headers(data: &[u8]) -> Vec<u16> {
        let words: Vec<u16> = data.chunks_exact(2).map(|p| u16::from_le_bytes([p[0], p[1]])).collect();
        let mut headers = Vec::new();
        let mut pos = 1;

        for _ in 0..(words[0] & legacy::BUFFER_EVENT_COUNT_MASK) {
            let header = words[pos];
            headers.push(header);
            pos += 1 + (header & legacy::EVENT_LENGTH_MASK) as usize;
        }

        headers
    }

    fn options(format: BufferFormat, buffer_bytes: usize) -> SynthOptions {
        SynthOptions {
            format,
            buffer_bytes,
            events: 200,
            max_dynamic_words: 150,
            timestamp_every: 10,
            drop_every: 0,
        }
    }

    #[test]
    fn test_usb_stream_replays_cleanly() {
        let (stats, buffers) = generate_buffers(&options(BufferFormat::FramedUsb, 512));
        assert_eq!(stats.events_generated, 200);
        assert_eq!(stats.buffers_written, buffers.len() as u64);
        assert!(buffers.len() > 10);
        assert!(buffers.iter().all(|b| b.data.len() <= 512 && b.data.len() % 4 == 0));

        let (sections, mut engine) = replay(BufferFormat::FramedUsb, &buffers);
        let counters = engine.snapshot();

        assert_eq!(sections, 200);
        assert_eq!(counters.parser.events_completed, 200);
        assert_eq!(counters.parser.parse_errors(), 0);
        assert_eq!(counters.parser.internal_buffer_loss, 0);
        assert_eq!(counters.parser.system_event_types[system_event::UNIX_TIMESTAMP as usize], 20);
        assert_eq!(counters.parser.system_event_types[system_event::END_OF_FILE as usize], 1);
    }

    #[test]
    fn test_eth_stream_replays_cleanly() {
        let (stats, buffers) = generate_buffers(&options(BufferFormat::FramedEth, 4096));
        assert_eq!(stats.buffers_dropped, 0);

        let (sections, mut engine) = replay(BufferFormat::FramedEth, &buffers);
        let counters = engine.snapshot();

        assert_eq!(sections, 200);
        assert_eq!(counters.parser.events_completed, 200);
        assert_eq!(counters.parser.eth_packet_loss, 0);
        assert_eq!(counters.parser.parse_errors(), 0);
        assert!(counters.parser.eth_packets_processed > buffers.len() as u64);
    }

    #[test]
    fn test_legacy_stream_splits_events() {
        let (_, buffers) = generate_buffers(&options(BufferFormat::Legacy, 128));

        // Odd sized continued records cut 32-bit words in half.
        let cut = buffers.iter().flat_map(|b| record_headers(&b.data)).any(|header| {
            header & legacy::EVENT_CONTINUATION != 0 && (header & legacy::EVENT_LENGTH_MASK) % 2 == 1
        });
        assert!(cut);

        let (sections, mut engine) = replay(BufferFormat::Legacy, &buffers);
        let counters = engine.snapshot();

        assert_eq!(sections, 200);
        assert_eq!(counters.legacy.events_written, 200);
        assert_eq!(counters.legacy.buffers_with_errors, 0);
        assert_eq!(counters.legacy.unused_bytes, 0);
    }

    #[test]
    fn test_dropped_buffers_are_counted_as_loss() {
        let mut opts = options(BufferFormat::FramedUsb, 256);
        opts.drop_every = 7;

        let (stats, buffers) = generate_buffers(&opts);
        assert!(stats.buffers_dropped > 0);

        let (sections, mut engine) = replay(BufferFormat::FramedUsb, &buffers);
        let counters = engine.snapshot();

        // A dropped final buffer is never noticed by the parser.
        let last = buffers.last().unwrap().buffer_number;
        let noticed = (1..last).filter(|n| n % 7 == 0).count() as u64;
        assert_eq!(counters.parser.internal_buffer_loss, noticed);
        assert!(sections < 200);
        assert_eq!(sections, counters.parser.events_completed);
    }

    #[test]
    fn test_framed_event_splits_large_block_reads() {
        let modules = vec![ModuleData {
            prefix: vec![1],
            dynamic: Some((0..600).collect()),
            suffix: vec![2],
        }];

        let frames = framed_event(0, &modules);
        assert!(frames.len() > 1);

        let first = vme_stream::FrameInfo::from_header(frames[0][0]);
        assert_eq!(first.kind(), Some(FrameType::StackFrame));
        assert_eq!(first.stack, 1);
        assert!(first.flags.continues());

        let last = vme_stream::FrameInfo::from_header(frames[frames.len() - 1][0]);
        assert_eq!(last.kind(), Some(FrameType::StackContinuation));
        assert!(!last.flags.continues());

        for f in &frames {
            assert!(f.len() - 1 <= MAX_STACK_FRAME_WORDS);
            assert_eq!(vme_stream::FrameInfo::from_header(f[0]).len as usize, f.len() - 1);
        }
    }

    #[test]
    fn test_buffer_size_minimum() {
        let opts = options(BufferFormat::FramedEth, 256);
        let err = generate(&readout(), &opts, |_, _| Ok(())).unwrap_err();
        assert!(err.to_string().contains("minimum"));
    }
}
