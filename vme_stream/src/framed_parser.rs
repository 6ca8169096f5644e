/*!
Framed-stack readout parser.

Consumes one raw readout buffer at a time (a bulk USB buffer or a sequence of
Ethernet packets) and reassembles the events described by the
[`ReadoutInfo`](crate::readout_info::ReadoutInfo) layout.

Event data is staged in a work buffer, split per module into prefix, dynamic
and suffix spans. Callbacks are only invoked once every module of an event has
been seen, so events cut short by buffer loss, packet loss or corrupt frames
never reach the consumer.

All state that has to survive a buffer boundary lives in
[`ReadoutParserState`]: the open stack and block frames with their remaining
word counts, the current event/module position and the last buffer and packet
numbers. Running out of input in the middle of a frame is the normal case and
parsing resumes on the next buffer exactly where it stopped.
*/

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::counters::ParserCounters;
use crate::cursor::{Alignment, WordCursor};
use crate::error::EndOfBuffer;
use crate::frame::{
    calc_buffer_loss, calc_packet_loss, is_known_system_event, FrameInfo, PayloadHeader,
    SystemEventHeader,
};
use crate::protocol::frame;
use crate::readout_info::{ModuleReadoutInfo, ReadoutInfo};

/// Outcome of parsing a buffer, packet or frame sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ParseResult {
    Ok,
    NoHeaderPresent,
    NoStackFrameFound,
    NotAStackFrame,
    NotABlockFrame,
    NotAStackContinuation,
    StackIndexChanged,
    StackIndexOutOfRange,
    GroupIndexOutOfRange,
    EmptyStackFrame,
    UnexpectedOpenBlockFrame,
    ParseReadoutContentsNotAdvancing,
    ParseEthBufferNotAdvancing,
    ParseEthPacketNotAdvancing,
}

impl ParseResult {
    pub const COUNT: usize = 14;

    pub const ALL: [ParseResult; Self::COUNT] = [
        Self::Ok,
        Self::NoHeaderPresent,
        Self::NoStackFrameFound,
        Self::NotAStackFrame,
        Self::NotABlockFrame,
        Self::NotAStackContinuation,
        Self::StackIndexChanged,
        Self::StackIndexOutOfRange,
        Self::GroupIndexOutOfRange,
        Self::EmptyStackFrame,
        Self::UnexpectedOpenBlockFrame,
        Self::ParseReadoutContentsNotAdvancing,
        Self::ParseEthBufferNotAdvancing,
        Self::ParseEthPacketNotAdvancing,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::NoHeaderPresent => "NoHeaderPresent",
            Self::NoStackFrameFound => "NoStackFrameFound",
            Self::NotAStackFrame => "NotAStackFrame",
            Self::NotABlockFrame => "NotABlockFrame",
            Self::NotAStackContinuation => "NotAStackContinuation",
            Self::StackIndexChanged => "StackIndexChanged",
            Self::StackIndexOutOfRange => "StackIndexOutOfRange",
            Self::GroupIndexOutOfRange => "GroupIndexOutOfRange",
            Self::EmptyStackFrame => "EmptyStackFrame",
            Self::UnexpectedOpenBlockFrame => "UnexpectedOpenBlockFrame",
            Self::ParseReadoutContentsNotAdvancing => "ParseReadoutContentsNotAdvancing",
            Self::ParseEthBufferNotAdvancing => "ParseEthBufferNotAdvancing",
            Self::ParseEthPacketNotAdvancing => "ParseEthPacketNotAdvancing",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Errors raised while an event was in progress leave the cursor on the
    /// offending word. That word may well start the next event, so after
    /// clearing the event the USB parser retries from the same position once.
    fn retry_in_place(self) -> bool {
        matches!(
            self,
            Self::NotAStackContinuation
                | Self::StackIndexChanged
                | Self::NotABlockFrame
                | Self::UnexpectedOpenBlockFrame
                | Self::GroupIndexOutOfRange
                | Self::EmptyStackFrame
        )
    }
}

impl std::fmt::Display for ParseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives reassembled events and system events.
///
/// Data slices are only valid for the duration of the call.
pub trait ReadoutCallbacks {
    fn begin_event(&mut self, _event_index: usize) {}

    /// Called for every segment unless the segment specific methods are
    /// overridden
    fn module_data(&mut self, _event_index: usize, _module_index: usize, _data: &[u32]) {}

    fn module_prefix(&mut self, event_index: usize, module_index: usize, data: &[u32]) {
        self.module_data(event_index, module_index, data)
    }

    fn module_dynamic(&mut self, event_index: usize, module_index: usize, data: &[u32]) {
        self.module_data(event_index, module_index, data)
    }

    fn module_suffix(&mut self, event_index: usize, module_index: usize, data: &[u32]) {
        self.module_data(event_index, module_index, data)
    }

    fn end_event(&mut self, _event_index: usize) {}

    /// System event frame including its header word
    fn system_event(&mut self, _header: &[u32]) {}
}

/// Transport the framed-stack data arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramedTransport {
    Eth,
    Usb,
}

/// Segment of the current module being parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModuleParseState {
    #[default]
    Prefix,
    Dynamic,
    Suffix,
}

/// Location of a segment inside the work buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub size: usize,
}

impl Span {
    fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleSpans {
    pub prefix: Span,
    pub dynamic: Span,
    pub suffix: Span,
}

/// A frame header and the number of its words not consumed yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameState {
    pub header: u32,
    pub words_left: u16,
}

impl FrameState {
    pub fn new(header: u32) -> Self {
        Self {
            header,
            words_left: FrameInfo::from_header(header).len,
        }
    }

    pub fn info(&self) -> FrameInfo {
        FrameInfo::from_header(self.header)
    }

    pub fn is_open(&self) -> bool {
        self.words_left > 0
    }

    fn consume(&mut self, words: usize) {
        self.words_left = self.words_left.saturating_sub(words as u16);
    }
}

/// Cross-buffer state of one framed-stack readout stream
#[derive(Debug, Clone)]
pub struct ReadoutParserState {
    readout: Vec<Vec<ModuleReadoutInfo>>,
    pub last_buffer_number: u32,
    pub last_packet_number: Option<u16>,
    /// Index of the event being assembled, `None` while idle
    pub event_index: Option<usize>,
    pub module_index: usize,
    pub module_state: ModuleParseState,
    pub stack_frame: FrameState,
    pub block_frame: FrameState,
    work_buffer: Vec<u32>,
    spans: Vec<ModuleSpans>,
    system_event: Vec<u32>,
    pub counters: ParserCounters,
}

impl ReadoutParserState {
    pub fn new(info: &ReadoutInfo) -> Self {
        Self::from_readout_structure(info.readout_structure())
    }

    pub fn from_readout_structure(readout: Vec<Vec<ModuleReadoutInfo>>) -> Self {
        let max_modules = readout.iter().map(Vec::len).max().unwrap_or(0);

        Self {
            readout,
            last_buffer_number: 0,
            last_packet_number: None,
            event_index: None,
            module_index: 0,
            module_state: ModuleParseState::Prefix,
            stack_frame: FrameState::default(),
            block_frame: FrameState::default(),
            work_buffer: Vec::with_capacity(1024),
            spans: vec![ModuleSpans::default(); max_modules],
            system_event: Vec::new(),
            counters: ParserCounters::new(),
        }
    }

    pub fn readout_structure(&self) -> &[Vec<ModuleReadoutInfo>] {
        &self.readout
    }

    pub fn is_event_in_progress(&self) -> bool {
        self.event_index.is_some()
    }

    /// Drop the event being assembled
    pub fn clear_event_state(&mut self) {
        self.event_index = None;
        self.module_index = 0;
        self.module_state = ModuleParseState::Prefix;
        self.stack_frame = FrameState::default();
        self.block_frame = FrameState::default();
    }

    /// Return to the state of a freshly started run. Counters are kept.
    pub fn reset(&mut self) {
        self.clear_event_state();
        self.last_buffer_number = 0;
        self.last_packet_number = None;
        self.work_buffer.clear();
    }

    fn begin_event(&mut self, header: u32) -> ParseResult {
        debug_assert!(!self.is_event_in_progress());

        let info = FrameInfo::from_header(header);

        if info.frame_type != frame::STACK_FRAME {
            warn!("NotAStackFrame: 0x{:08x}", header);
            return ParseResult::NotAStackFrame;
        }

        let stack = info.stack as usize;

        if stack == 0 || stack > self.readout.len() {
            return ParseResult::StackIndexOutOfRange;
        }

        self.work_buffer.clear();
        self.spans.fill(ModuleSpans::default());

        self.event_index = Some(stack - 1);
        self.module_index = 0;
        self.module_state = ModuleParseState::Prefix;
        self.stack_frame = FrameState::new(header);
        self.block_frame = FrameState::default();

        ParseResult::Ok
    }
}

/// Copy `words` words from the input into the work buffer, extending `span`
fn copy_to_work_buffer(
    work_buffer: &mut Vec<u32>,
    span: &mut Span,
    input: &mut WordCursor<'_>,
    words: usize,
) -> Result<(), EndOfBuffer> {
    let mut chunk = input.split_words(words)?;

    if span.size == 0 {
        span.offset = work_buffer.len();
    }

    while let Ok(word) = chunk.extract_word() {
        work_buffer.push(word);
    }
    span.size += words;
    Ok(())
}

/// Forward a system event frame at the cursor position. Returns false, without
/// moving the cursor, if the next word is not a known system event header.
fn try_handle_system_event<C: ReadoutCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    input: &mut WordCursor<'_>,
) -> Result<bool, EndOfBuffer> {
    let Ok(header) = input.peek_word() else {
        return Ok(false);
    };

    if !is_known_system_event(header) {
        return Ok(false);
    }

    let Some(sys) = SystemEventHeader::from_header(header) else {
        return Ok(false);
    };

    // The whole frame must be contained in the buffer.
    let mut frame_words = input.split_words(sys.len as usize + 1)?;

    state.system_event.clear();
    while let Ok(word) = frame_words.extract_word() {
        state.system_event.push(word);
    }

    state.counters.system_event_types[sys.subtype as usize] += 1;
    callbacks.system_event(&state.system_event);
    Ok(true)
}

enum FrameSearch {
    Found,
    NotFound,
    Exhausted,
}

/// Move forward to the next StackFrame header, skipping whole continuation
/// frames. Any other frame type stops the search so that garbage is never
/// used to compute a skip length.
fn find_stack_frame_header(input: &mut WordCursor<'_>) -> Result<FrameSearch, EndOfBuffer> {
    while !input.at_end() {
        let info = FrameInfo::from_header(input.peek_word()?);

        if info.frame_type == frame::STACK_FRAME {
            return Ok(FrameSearch::Found);
        }

        if info.frame_type != frame::STACK_CONTINUATION {
            return Ok(FrameSearch::NotFound);
        }

        // A continuation running past the end belongs to an event that was
        // already dropped. Its tail is skipped in the next buffer.
        let frame_words = info.len as usize + 1;
        if frame_words > input.words_left() {
            input.skip(input.words_left())?;
            return Ok(FrameSearch::Exhausted);
        }

        input.skip(frame_words)?;
    }

    Ok(FrameSearch::Exhausted)
}

fn flush_event<C: ReadoutCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    event_index: usize,
) {
    let module_count = state.readout[event_index].len();

    callbacks.begin_event(event_index);

    for (mi, spans) in state.spans.iter().take(module_count).enumerate() {
        if spans.prefix.size > 0 {
            callbacks.module_prefix(event_index, mi, &state.work_buffer[spans.prefix.range()]);
        }

        if spans.dynamic.size > 0 {
            callbacks.module_dynamic(event_index, mi, &state.work_buffer[spans.dynamic.range()]);
        }

        if spans.suffix.size > 0 {
            callbacks.module_suffix(event_index, mi, &state.work_buffer[spans.suffix.range()]);
        }
    }

    callbacks.end_event(event_index);
    state.counters.events_completed += 1;
}

/// Parse frames from `input` until it is exhausted or an error occurs.
///
/// With a USB buffer `input` spans the whole buffer, with Ethernet it is
/// bounded to a single packet's payload. The cursor has to be placed on a
/// frame header unless an event is in progress.
fn parse_readout_contents<C: ReadoutCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    input: &mut WordCursor<'_>,
    transport: FramedTransport,
    buffer_number: u32,
) -> Result<ParseResult, EndOfBuffer> {
    while !input.at_end() {
        let last_position = input.position();

        if !state.stack_frame.is_open() {
            if state.block_frame.is_open() {
                return Ok(ParseResult::UnexpectedOpenBlockFrame);
            }

            // Packet payloads may start with trailing data of the previous
            // frame which can look like a system event header. System events
            // in Ethernet buffers are handled between packets instead.
            if transport == FramedTransport::Usb && try_handle_system_event(state, callbacks, input)? {
                continue;
            }

            if let Some(event_index) = state.event_index {
                // The header stays in the input on error so that the caller
                // can clear the event and retry from here.
                let header = input.peek_word()?;
                let info = FrameInfo::from_header(header);

                if info.frame_type != frame::STACK_CONTINUATION {
                    return Ok(ParseResult::NotAStackContinuation);
                }

                if info.stack as usize != event_index + 1 {
                    return Ok(ParseResult::StackIndexChanged);
                }

                state.stack_frame = FrameState::new(header);
                input.skip(1)?;
            } else {
                let search_start = input.position();
                let search = find_stack_frame_header(input)?;
                state.counters.unused_bytes += (input.position() - search_start) as u64;

                match search {
                    FrameSearch::Found => {}
                    FrameSearch::NotFound => return Ok(ParseResult::NoStackFrameFound),
                    FrameSearch::Exhausted => break,
                }

                let header = input.peek_word()?;
                let pr = state.begin_event(header);

                if pr != ParseResult::Ok {
                    debug!(
                        "{} at offset {} of buffer {} (header=0x{:08x})",
                        pr,
                        input.position(),
                        buffer_number,
                        header
                    );
                    return Ok(pr);
                }

                input.skip(1)?;

                let expects_data = state
                    .event_index
                    .map(|ei| state.readout[ei].iter().any(|m| !m.is_empty()))
                    .unwrap_or(false);

                if expects_data && !state.stack_frame.is_open() {
                    state.clear_event_state();
                    return Ok(ParseResult::EmptyStackFrame);
                }
            }
        }

        let Some(event_index) = state.event_index else {
            continue;
        };

        let module_count = state.readout[event_index].len();

        // Events without modules still produce an (empty) stack frame.
        if module_count == 0 {
            let frame_len = state.stack_frame.info().len;
            if frame_len != 0 {
                warn!(
                    "No modules in event {} but got a non-empty stack frame of len {} (header=0x{:08x})",
                    event_index, frame_len, state.stack_frame.header
                );
                let skip = (state.stack_frame.words_left as usize).min(input.words_left());
                input.skip(skip)?;
                state.counters.unused_bytes += (skip * 4) as u64;
            }
            state.clear_event_state();
            continue;
        }

        if state.module_index >= module_count {
            return Ok(ParseResult::GroupIndexOutOfRange);
        }

        let mi = state.module_index;
        let parts = state.readout[event_index][mi];

        if parts.is_empty() {
            state.module_index += 1;
        } else {
            match state.module_state {
                ModuleParseState::Prefix => {
                    let spans = &mut state.spans[mi];
                    let wanted = parts.prefix_len as usize;

                    if spans.prefix.size < wanted {
                        let words = (wanted - spans.prefix.size)
                            .min(state.stack_frame.words_left as usize)
                            .min(input.words_left());

                        copy_to_work_buffer(&mut state.work_buffer, &mut spans.prefix, input, words)?;
                        state.stack_frame.consume(words);
                    }

                    if spans.prefix.size == wanted {
                        if parts.has_dynamic {
                            state.module_state = ModuleParseState::Dynamic;
                            continue;
                        } else if parts.suffix_len != 0 {
                            state.module_state = ModuleParseState::Suffix;
                            continue;
                        } else {
                            state.module_index += 1;
                            state.module_state = ModuleParseState::Prefix;
                        }
                    }
                }

                ModuleParseState::Dynamic => {
                    if !state.block_frame.is_open() {
                        let header = input.peek_word()?;
                        let block = FrameState::new(header);

                        if block.info().frame_type != frame::BLOCK_READ {
                            debug!(
                                "NotABlockFrame: type=0x{:02x}, frameHeader=0x{:08x}",
                                block.info().frame_type,
                                header
                            );
                            state.clear_event_state();
                            return Ok(ParseResult::NotABlockFrame);
                        }

                        // Consume the block header, it counts toward the
                        // enclosing stack frame.
                        state.block_frame = block;
                        input.skip(1)?;
                        state.stack_frame.consume(1);
                    }

                    let spans = &mut state.spans[mi];
                    let words = (state.block_frame.words_left as usize).min(input.words_left());

                    copy_to_work_buffer(&mut state.work_buffer, &mut spans.dynamic, input, words)?;
                    state.stack_frame.consume(words);
                    state.block_frame.consume(words);

                    if !state.block_frame.is_open() && !state.block_frame.info().flags.continues() {
                        if parts.suffix_len == 0 {
                            state.module_index += 1;
                            state.module_state = ModuleParseState::Prefix;
                        } else {
                            state.module_state = ModuleParseState::Suffix;
                            continue;
                        }
                    }
                }

                ModuleParseState::Suffix => {
                    let spans = &mut state.spans[mi];
                    let wanted = parts.suffix_len as usize;

                    if spans.suffix.size < wanted {
                        let words = (wanted - spans.suffix.size)
                            .min(state.stack_frame.words_left as usize)
                            .min(input.words_left());

                        copy_to_work_buffer(&mut state.work_buffer, &mut spans.suffix, input, words)?;
                        state.stack_frame.consume(words);
                    }

                    if spans.suffix.size >= wanted {
                        state.module_index += 1;
                        state.module_state = ModuleParseState::Prefix;
                    }
                }
            }
        }

        // Modules without readout data (disabled modules) are skipped.
        while state.module_index < module_count && state.readout[event_index][state.module_index].is_empty() {
            state.module_index += 1;
        }

        if state.module_index >= module_count {
            flush_event(state, callbacks, event_index);
            state.clear_event_state();
        }

        if input.position() == last_position {
            return Ok(ParseResult::ParseReadoutContentsNotAdvancing);
        }
    }

    Ok(ParseResult::Ok)
}

fn apply_buffer_loss(state: &mut ReadoutParserState, buffer_number: u32) -> u32 {
    let last_buffer_number = state.last_buffer_number;
    let loss = calc_buffer_loss(buffer_number, last_buffer_number);
    state.last_buffer_number = buffer_number;

    if loss != 0 {
        debug!(
            "internal buffer loss: buffer {} follows {} (loss={})",
            buffer_number, last_buffer_number, loss
        );
        state.clear_event_state();
        state.counters.internal_buffer_loss += loss as u64;
    }

    loss
}

/// Parse one buffer of either transport
pub fn parse_readout_buffer<C: ReadoutCallbacks + ?Sized>(
    transport: FramedTransport,
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    buffer_number: u32,
    buffer: &[u8],
) -> Result<ParseResult, EndOfBuffer> {
    match transport {
        FramedTransport::Eth => parse_readout_buffer_eth(state, callbacks, buffer_number, buffer),
        FramedTransport::Usb => parse_readout_buffer_usb(state, callbacks, buffer_number, buffer),
    }
}

/// Parse one packet. `input` is bounded to the packet including its two
/// Ethernet headers. Packet loss must have been handled by the caller.
fn parse_eth_packet<C: ReadoutCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    mut input: WordCursor<'_>,
    buffer_number: u32,
) -> Result<ParseResult, EndOfBuffer> {
    let header = PayloadHeader::new(input.extract_word()?, input.extract_word()?);

    trace!(
        "begin parsing packet {}, dataWords={}",
        header.packet_number(),
        header.data_word_count()
    );

    if !state.is_event_in_progress() {
        // Idle: a new event can only start at the header the packet points to.
        if !header.is_next_header_pointer_present() {
            return Ok(ParseResult::NoHeaderPresent);
        }

        let skip = header.next_header_pointer() as usize;
        input.skip(skip)?;
        state.counters.unused_bytes += (skip * 4) as u64;
    }

    while !input.at_end() {
        let last_position = input.position();

        let pr = parse_readout_contents(state, callbacks, &mut input, FramedTransport::Eth, buffer_number)?;

        if pr != ParseResult::Ok {
            return Ok(pr);
        }

        if input.position() == last_position {
            return Ok(ParseResult::ParseEthPacketNotAdvancing);
        }
    }

    Ok(ParseResult::Ok)
}

/// Parse a buffer made of Ethernet packets and system event frames.
///
/// Every packet must be fully contained in the buffer. Errors inside a packet
/// discard the event in progress and the rest of that packet.
pub fn parse_readout_buffer_eth<C: ReadoutCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    buffer_number: u32,
    buffer: &[u8],
) -> Result<ParseResult, EndOfBuffer> {
    trace!("begin parsing ETH buffer {}, size={} bytes", buffer_number, buffer.len());

    if apply_buffer_loss(state, buffer_number) != 0 {
        // Packet numbers restart with the next received buffer, otherwise the
        // buffer loss would also show up as packet loss.
        state.last_packet_number = None;
    }

    let mut input = WordCursor::new(buffer, Alignment::Word32);
    let outcome = parse_eth_packets(state, callbacks, &mut input, buffer_number);

    state.counters.buffers_processed += 1;
    state.counters.unused_bytes += input.bytes_left() as u64;

    if let Err(e) = outcome {
        warn!("end parsing ETH buffer {}, size={} bytes: {}", buffer_number, buffer.len(), e);
        state.clear_event_state();
        state.counters.end_of_buffer_errors += 1;
    }

    outcome
}

fn parse_eth_packets<C: ReadoutCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    input: &mut WordCursor<'_>,
    buffer_number: u32,
) -> Result<ParseResult, EndOfBuffer> {
    let mut result = ParseResult::Ok;

    while !input.at_end() {
        let last_position = input.position();

        if try_handle_system_event(state, callbacks, input)? {
            continue;
        }

        let header = PayloadHeader::new(input.peek_word_at(0)?, input.peek_word_at(1)?);
        let packet_words = header.packet_words();
        let packet = input.split_words(packet_words)?;
        let packet_number = header.packet_number();

        if let Some(last_packet) = state.last_packet_number {
            let loss = calc_packet_loss(last_packet, packet_number);
            if loss != 0 {
                warn!(
                    "packet loss detected: lastPacketNumber={}, packetNumber={}, loss={}",
                    last_packet, packet_number, loss
                );
                state.clear_event_state();
                state.counters.eth_packet_loss += loss as u64;
            }
        }

        state.last_packet_number = Some(packet_number);
        state.counters.eth_packets_processed += 1;

        match parse_eth_packet(state, callbacks, packet, buffer_number) {
            Ok(ParseResult::Ok) => {}
            Ok(pr) => {
                debug!("packet {} of buffer {}: {}", packet_number, buffer_number, pr);
                state.clear_event_state();
                state.counters.count_parse_result(pr);
                state.counters.unused_bytes += (packet_words * 4) as u64;
                result = pr;
            }
            Err(e) => {
                debug!("packet {} of buffer {}: {}", packet_number, buffer_number, e);
                state.clear_event_state();
                state.counters.end_of_buffer_errors += 1;
                state.counters.unused_bytes += (packet_words * 4) as u64;
            }
        }

        if input.position() == last_position {
            state.counters.count_parse_result(ParseResult::ParseEthBufferNotAdvancing);
            return Ok(ParseResult::ParseEthBufferNotAdvancing);
        }
    }

    Ok(result)
}

/// Parse a bulk USB buffer. The buffer starts on a frame header unless it
/// continues an event from the previous buffer.
///
/// Errors discard the event in progress and parsing continues inside the
/// same buffer. Returns the last error seen, or `Ok`.
pub fn parse_readout_buffer_usb<C: ReadoutCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    buffer_number: u32,
    buffer: &[u8],
) -> Result<ParseResult, EndOfBuffer> {
    trace!("begin parsing USB buffer {}, size={} bytes", buffer_number, buffer.len());

    apply_buffer_loss(state, buffer_number);

    let mut input = WordCursor::new(buffer, Alignment::Word32);
    let mut result = ParseResult::Ok;
    let mut last_error_position = None;

    while !input.at_end() {
        match parse_readout_contents(state, callbacks, &mut input, FramedTransport::Usb, buffer_number) {
            Ok(ParseResult::Ok) => {}
            Ok(pr) => {
                state.clear_event_state();
                state.counters.count_parse_result(pr);
                result = pr;

                let position = input.position();

                if !pr.retry_in_place() || last_error_position == Some(position) {
                    if input.skip(1).is_ok() {
                        state.counters.unused_bytes += 4;
                    }
                }

                last_error_position = Some(position);
            }
            Err(e) => {
                warn!("end parsing USB buffer {}, size={} bytes: {}", buffer_number, buffer.len(), e);
                state.clear_event_state();
                state.counters.end_of_buffer_errors += 1;
                state.counters.buffers_processed += 1;
                state.counters.unused_bytes += input.bytes_left() as u64;
                return Err(e);
            }
        }
    }

    state.counters.buffers_processed += 1;
    state.counters.unused_bytes += input.bytes_left() as u64;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::make_frame_header;
    use crate::frame::FrameType;
    use crate::protocol::{eth, system_event};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Begin(usize),
        Prefix(usize, usize, Vec<u32>),
        Dynamic(usize, usize, Vec<u32>),
        Suffix(usize, usize, Vec<u32>),
        End(usize),
        System(Vec<u32>),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl ReadoutCallbacks for Recorder {
        fn begin_event(&mut self, ei: usize) {
            self.calls.push(Call::Begin(ei));
        }

        fn module_prefix(&mut self, ei: usize, mi: usize, data: &[u32]) {
            self.calls.push(Call::Prefix(ei, mi, data.to_vec()));
        }

        fn module_dynamic(&mut self, ei: usize, mi: usize, data: &[u32]) {
            self.calls.push(Call::Dynamic(ei, mi, data.to_vec()));
        }

        fn module_suffix(&mut self, ei: usize, mi: usize, data: &[u32]) {
            self.calls.push(Call::Suffix(ei, mi, data.to_vec()));
        }

        fn end_event(&mut self, ei: usize) {
            self.calls.push(Call::End(ei));
        }

        fn system_event(&mut self, header: &[u32]) {
            self.calls.push(Call::System(header.to_vec()));
        }
    }

    impl Recorder {
        fn events(&self) -> usize {
            self.calls.iter().filter(|c| matches!(c, Call::End(_))).count()
        }
    }

    fn bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn stack(stack: u8, len: u16) -> u32 {
        make_frame_header(FrameType::StackFrame, 0, stack, len)
    }

    fn continuation(stack: u8, len: u16) -> u32 {
        make_frame_header(FrameType::StackContinuation, 0, stack, len)
    }

    fn block(len: u16, continues: bool) -> u32 {
        let flags = if continues { frame::FLAG_CONTINUE } else { 0 };
        make_frame_header(FrameType::BlockRead, flags, 0, len)
    }

    fn single_module_state() -> ReadoutParserState {
        ReadoutParserState::from_readout_structure(vec![vec![ModuleReadoutInfo::new(2, true, 1)]])
    }

    /// Event 0 with one module: 2 prefix words, 3 dynamic words, 1 suffix word
    fn scenario_event(base: u32) -> Vec<u32> {
        vec![
            stack(1, 7),
            base,
            base + 1,
            block(3, false),
            base + 2,
            base + 3,
            base + 4,
            base + 5,
        ]
    }

    fn scenario_calls(base: u32) -> Vec<Call> {
        vec![
            Call::Begin(0),
            Call::Prefix(0, 0, vec![base, base + 1]),
            Call::Dynamic(0, 0, vec![base + 2, base + 3, base + 4]),
            Call::Suffix(0, 0, vec![base + 5]),
            Call::End(0),
        ]
    }

    #[test]
    fn test_end_to_end_callback_sequence() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        let pr = parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&scenario_event(0x100))).unwrap();

        assert_eq!(pr, ParseResult::Ok);
        assert_eq!(rec.calls, scenario_calls(0x100));
        assert!(!state.is_event_in_progress());
        assert_eq!(state.counters.internal_buffer_loss, 0);
        assert_eq!(state.counters.buffers_processed, 1);
        assert_eq!(state.counters.unused_bytes, 0);
    }

    #[test]
    fn test_resume_mid_block_across_buffers() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();
        let words = scenario_event(0x200);

        // Split inside the block frame: header, p0, p1, block hdr, d0 | d1, d2, s0
        parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&words[..5])).unwrap();
        assert!(rec.calls.is_empty());
        assert!(state.is_event_in_progress());
        assert_eq!(state.module_state, ModuleParseState::Dynamic);
        assert_eq!(state.block_frame.words_left, 2);
        assert_eq!(state.stack_frame.words_left, 3);

        parse_readout_buffer_usb(&mut state, &mut rec, 2, &bytes(&words[5..])).unwrap();
        assert_eq!(rec.calls, scenario_calls(0x200));
        assert_eq!(state.counters.internal_buffer_loss, 0);
    }

    #[test]
    fn test_dynamic_segment_spans_continuation_frames() {
        let mut state = ReadoutParserState::from_readout_structure(vec![vec![ModuleReadoutInfo::new(1, true, 1)]]);
        let mut rec = Recorder::default();

        // The block read is split into two block frames, the second one
        // inside a stack continuation frame delivered with the next buffer.
        let first = vec![stack(1, 4), 0xa0, block(2, true), 0xd0, 0xd1];
        let second = vec![continuation(1, 4), block(2, false), 0xd2, 0xd3, 0x50];

        parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&first)).unwrap();
        assert!(rec.calls.is_empty());
        parse_readout_buffer_usb(&mut state, &mut rec, 2, &bytes(&second)).unwrap();

        assert_eq!(
            rec.calls,
            vec![
                Call::Begin(0),
                Call::Prefix(0, 0, vec![0xa0]),
                Call::Dynamic(0, 0, vec![0xd0, 0xd1, 0xd2, 0xd3]),
                Call::Suffix(0, 0, vec![0x50]),
                Call::End(0),
            ]
        );
    }

    #[test]
    fn test_buffer_gap_resynchronizes() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        let event_a = scenario_event(0x1000);
        let event_b = scenario_event(0x2000);
        let event_c = scenario_event(0x3000);
        let event_d = scenario_event(0x4000);

        let buf1 = event_a.clone();
        let buf2 = event_b[..3].to_vec();
        // buffer 3 carried the rest of event b and the start of event c
        let mut buf4 = event_c[4..].to_vec();
        buf4.extend_from_slice(&event_d);

        parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&buf1)).unwrap();
        parse_readout_buffer_usb(&mut state, &mut rec, 2, &bytes(&buf2)).unwrap();
        parse_readout_buffer_usb(&mut state, &mut rec, 4, &bytes(&buf4)).unwrap();

        let mut expected = scenario_calls(0x1000);
        expected.extend(scenario_calls(0x4000));
        assert_eq!(rec.calls, expected);
        assert_eq!(state.counters.internal_buffer_loss, 1);
        assert_eq!(state.counters.parse_result_count(ParseResult::NoStackFrameFound), 4);
        assert_eq!(state.counters.unused_bytes, 16);
    }

    #[test]
    fn test_stack_index_out_of_range_skips_one_word() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        let mut words = vec![stack(5, 0)];
        words.extend(scenario_event(0x10));

        let pr = parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        assert_eq!(pr, ParseResult::StackIndexOutOfRange);
        assert_eq!(state.counters.parse_result_count(ParseResult::StackIndexOutOfRange), 1);
        assert_eq!(rec.calls, scenario_calls(0x10));
    }

    #[test]
    fn test_missing_block_frame_discards_event() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        // Stack frame whose dynamic part does not start with a block header,
        // followed by a good event.
        let mut words = vec![stack(1, 4), 0x1, 0x2, 0xdead_beef, 0x3];
        words.extend(scenario_event(0x20));

        parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        assert_eq!(state.counters.parse_result_count(ParseResult::NotABlockFrame), 1);
        assert_eq!(rec.calls, scenario_calls(0x20));
    }

    #[test]
    fn test_new_event_while_waiting_for_continuation() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        // The first event's stack frame ends before its suffix, the next
        // header starts a new event instead of continuing.
        let mut words = vec![stack(1, 2), 0x1, 0x2];
        words.extend(scenario_event(0x30));

        parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        assert_eq!(state.counters.parse_result_count(ParseResult::NotAStackContinuation), 1);
        assert_eq!(rec.calls, scenario_calls(0x30));
    }

    #[test]
    fn test_block_frame_outliving_stack_frame() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        // The block frame claims three words but its stack frame only has
        // room for one of them.
        let first = vec![stack(1, 4), 0x1, 0x2, block(3, false), 0xd0];
        parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&first)).unwrap();

        assert!(state.is_event_in_progress());
        assert!(!state.stack_frame.is_open());
        assert_eq!(state.block_frame.words_left, 2);

        let mut second = vec![0xd1, 0xd2];
        second.extend(scenario_event(0x50));
        let pr = parse_readout_buffer_usb(&mut state, &mut rec, 2, &bytes(&second)).unwrap();

        assert_eq!(pr, ParseResult::Ok);
        assert_eq!(state.counters.parse_result_count(ParseResult::UnexpectedOpenBlockFrame), 1);
        assert_eq!(rec.calls, scenario_calls(0x50));
        assert!(!state.is_event_in_progress());
    }

    #[test]
    fn test_usb_system_event_forwarded() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        let sys = SystemEventHeader {
            subtype: system_event::UNIX_TIMESTAMP,
            continued: false,
            len: 2,
        }
        .to_header();

        let mut words = vec![sys, 0x6000_0000, 0x0000_0001];
        words.extend(scenario_event(0x40));

        parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        assert_eq!(rec.calls[0], Call::System(vec![sys, 0x6000_0000, 0x0000_0001]));
        assert_eq!(&rec.calls[1..], scenario_calls(0x40).as_slice());
        assert_eq!(state.counters.system_event_types[system_event::UNIX_TIMESTAMP as usize], 1);
    }

    #[test]
    fn test_empty_modules_and_moduleless_events() {
        let mut state = ReadoutParserState::from_readout_structure(vec![
            vec![
                ModuleReadoutInfo::new(1, false, 0),
                ModuleReadoutInfo::default(),
                ModuleReadoutInfo::new(0, false, 1),
            ],
            vec![],
        ]);
        let mut rec = Recorder::default();

        let words = vec![stack(2, 0), stack(1, 2), 0xaa, 0xbb];
        parse_readout_buffer_usb(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        assert_eq!(
            rec.calls,
            vec![
                Call::Begin(0),
                Call::Prefix(0, 0, vec![0xaa]),
                Call::Suffix(0, 2, vec![0xbb]),
                Call::End(0),
            ]
        );
        assert_eq!(state.counters.parse_errors(), 0);
    }

    fn eth_packet(packet_number: u16, next_header_pointer: u16, payload: &[u32]) -> Vec<u32> {
        let header = PayloadHeader::encode(eth::CHANNEL_DATA, packet_number, payload.len() as u16, next_header_pointer);
        let mut words = vec![header.header0, header.header1];
        words.extend_from_slice(payload);
        words
    }

    #[test]
    fn test_eth_event_spanning_packets() {
        let mut state = ReadoutParserState::from_readout_structure(vec![vec![ModuleReadoutInfo::new(2, false, 0)]]);
        let mut rec = Recorder::default();

        let endian = SystemEventHeader {
            subtype: system_event::ENDIAN_MARKER,
            continued: false,
            len: 1,
        }
        .to_header();

        let mut words = vec![endian, system_event::ENDIAN_MARKER_VALUE];
        words.extend(eth_packet(0, 0, &[stack(1, 2), 0xa]));
        words.extend(eth_packet(1, 1, &[0xb, stack(1, 2), 0xc, 0xd]));

        let pr = parse_readout_buffer_eth(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        assert_eq!(pr, ParseResult::Ok);
        assert_eq!(
            rec.calls,
            vec![
                Call::System(vec![endian, system_event::ENDIAN_MARKER_VALUE]),
                Call::Begin(0),
                Call::Prefix(0, 0, vec![0xa, 0xb]),
                Call::End(0),
                Call::Begin(0),
                Call::Prefix(0, 0, vec![0xc, 0xd]),
                Call::End(0),
            ]
        );
        assert_eq!(state.counters.eth_packets_processed, 2);
        assert_eq!(state.counters.eth_packet_loss, 0);
        assert_eq!(state.last_packet_number, Some(1));
    }

    #[test]
    fn test_eth_block_frame_spanning_packets() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        let first_event = scenario_event(0x1);
        let mut second_payload = first_event[5..].to_vec();
        second_payload.extend(scenario_event(0x11));

        // Packet 0 ends inside the block frame, packet 1 points past its tail.
        let mut words = eth_packet(0, 0, &first_event[..5]);
        words.extend(eth_packet(1, 3, &second_payload));

        let pr = parse_readout_buffer_eth(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        let mut expected = scenario_calls(0x1);
        expected.extend(scenario_calls(0x11));

        assert_eq!(pr, ParseResult::Ok);
        assert_eq!(rec.calls, expected);
        assert_eq!(state.counters.eth_packet_loss, 0);
        assert_eq!(state.counters.parse_errors(), 0);
        assert_eq!(state.counters.unused_bytes, 0);
    }

    #[test]
    fn test_eth_packet_loss_uses_header_pointer() {
        let mut state = ReadoutParserState::from_readout_structure(vec![vec![ModuleReadoutInfo::new(2, false, 0)]]);
        let mut rec = Recorder::default();

        let mut words = eth_packet(0, 0, &[stack(1, 2), 0xa]);
        words.extend(eth_packet(2, 1, &[0xb, stack(1, 2), 0xc, 0xd]));

        parse_readout_buffer_eth(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        assert_eq!(
            rec.calls,
            vec![Call::Begin(0), Call::Prefix(0, 0, vec![0xc, 0xd]), Call::End(0)]
        );
        assert_eq!(state.counters.eth_packet_loss, 1);
        assert_eq!(state.counters.unused_bytes, 4);
    }

    #[test]
    fn test_eth_packet_without_header_while_idle() {
        let mut state = ReadoutParserState::from_readout_structure(vec![vec![ModuleReadoutInfo::new(2, false, 0)]]);
        let mut rec = Recorder::default();

        let mut words = eth_packet(7, eth::NO_HEADER_POINTER_PRESENT, &[0x1, 0x2]);
        words.extend(eth_packet(8, 0, &[stack(1, 2), 0x3, 0x4]));

        let pr = parse_readout_buffer_eth(&mut state, &mut rec, 1, &bytes(&words)).unwrap();

        assert_eq!(pr, ParseResult::NoHeaderPresent);
        assert_eq!(state.counters.parse_result_count(ParseResult::NoHeaderPresent), 1);
        assert_eq!(state.counters.unused_bytes, 16);
        assert_eq!(rec.events(), 1);
    }

    #[test]
    fn test_eth_buffer_loss_resets_packet_sequence() {
        let mut state = ReadoutParserState::from_readout_structure(vec![vec![ModuleReadoutInfo::new(2, false, 0)]]);
        let mut rec = Recorder::default();

        let first = eth_packet(10, 0, &[stack(1, 2), 0x1]);
        let third = eth_packet(40, 0, &[stack(1, 2), 0x5, 0x6]);

        parse_readout_buffer_eth(&mut state, &mut rec, 1, &bytes(&first)).unwrap();
        parse_readout_buffer_eth(&mut state, &mut rec, 3, &bytes(&third)).unwrap();

        assert_eq!(state.counters.internal_buffer_loss, 1);
        assert_eq!(state.counters.eth_packet_loss, 0);
        assert_eq!(rec.calls, vec![Call::Begin(0), Call::Prefix(0, 0, vec![0x5, 0x6]), Call::End(0)]);
    }

    #[test]
    fn test_truncated_packet_is_end_of_buffer() {
        let mut state = single_module_state();
        let mut rec = Recorder::default();

        let mut words = eth_packet(0, 0, &scenario_event(0x1));
        words.truncate(5);

        let err = parse_readout_buffer_eth(&mut state, &mut rec, 1, &bytes(&words)).unwrap_err();
        assert_eq!(err.wanted, 10 * 4);
        assert_eq!(state.counters.end_of_buffer_errors, 1);
        assert_eq!(state.counters.unused_bytes, 20);
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn test_parse_result_names() {
        assert_eq!(ParseResult::ALL.len(), ParseResult::COUNT);
        for (i, pr) in ParseResult::ALL.iter().enumerate() {
            assert_eq!(*pr as usize, i);
        }
        assert_eq!(ParseResult::NotABlockFrame.to_string(), "NotABlockFrame");
    }
}
