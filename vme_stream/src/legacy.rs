/*!
Legacy 16-bit aligned buffer processor.

A legacy controller buffer is a 16-bit buffer header holding the number of
event records, followed by that many records and `0xFFFF` terminators. Each
record starts with a 16-bit header (stack id, continuation bit, length in
16-bit words). Module data inside a record is a sequence of 32-bit values,
each module terminated by the literal [`END_MARKER`](listfile::END_MARKER).

Events larger than the controller's buffer are split into continuation
records spread over several buffers. Because the data is only 16-bit aligned
a 32-bit value can be cut in half at such a split: the low half is carried in
[`ProcessorState::partial_data`] and joined with the first half-word of the
next record.

The processor writes events straight into the held output buffer through a
[`StreamWriter`]. The output buffer stays with the processor while an event
is continued, so module and event sections left open across buffers are
patched in place once the final record arrives.
*/

use tracing::{debug, trace, warn};

use crate::buffer_queue::OutputBuffers;
use crate::counters::LegacyCounters;
use crate::cursor::{Alignment, WordCursor};
use crate::error::EndOfBuffer;
use crate::frame::calc_buffer_loss;
use crate::protocol::{legacy, listfile};
use crate::readout_info::ReadoutInfo;
use crate::stream_writer::{DataBuffer, StreamWriter, WriterLimits};

/// What to do after an event record has been processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorAction {
    /// Reset the state and keep writing into the same output buffer
    Continue,
    /// More continuation records follow, keep the state
    KeepState,
    /// Hand the output buffer to the consumer and reset the state
    FlushBuffer,
    /// Abandon the rest of the input buffer
    SkipInput,
}

/// State carried from one event record to the next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorState {
    /// Stack id of the event in progress
    pub stack_id: Option<u8>,
    pub event_index: usize,
    /// Index of the module currently or last written
    pub module_index: Option<usize>,
    /// Low half of a 32-bit value cut at the end of the previous record
    pub partial_data: Option<u16>,
    /// The event in progress started with a continuation record
    pub was_partial: bool,
}

pub struct LegacyProcessor {
    readout: ReadoutInfo,
    state: ProcessorState,
    writer: StreamWriter,
    last_buffer_number: u32,
    pub counters: LegacyCounters,
}

impl LegacyProcessor {
    pub fn new(readout: ReadoutInfo, limits: WriterLimits) -> Self {
        Self {
            readout,
            state: ProcessorState::default(),
            writer: StreamWriter::new(limits),
            last_buffer_number: 0,
            counters: LegacyCounters::default(),
        }
    }

    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    pub fn has_partial_data(&self) -> bool {
        self.state.partial_data.is_some()
    }

    pub fn is_event_in_progress(&self) -> bool {
        self.state.stack_id.is_some()
    }

    /// Forget the event in progress and remove what was written of it
    pub fn discard_event(&mut self, out: &mut OutputBuffers) {
        if let Some(start) = self.writer.event_start() {
            if out.has_current() {
                out.current().truncate(start);
            }
        }

        self.writer.reset();
        self.state = ProcessorState::default();
    }

    /// Return to the state of a freshly started run. Counters are kept.
    pub fn reset(&mut self, out: &mut OutputBuffers) {
        self.discard_event(out);
        self.last_buffer_number = 0;
    }

    /// Process one raw legacy buffer.
    ///
    /// Returns the action of the last processed event record. Running out of
    /// input is reported as an error after the buffer has been abandoned.
    pub fn process_buffer(
        &mut self,
        buffer_number: u32,
        data: &[u8],
        out: &mut OutputBuffers,
    ) -> Result<ProcessorAction, EndOfBuffer> {
        let loss = calc_buffer_loss(buffer_number, self.last_buffer_number);
        self.last_buffer_number = buffer_number;

        if loss != 0 {
            debug!("buffer {}: {} buffers lost, dropping event in progress", buffer_number, loss);
            self.counters.internal_buffer_loss += loss as u64;
            self.discard_event(out);
        }

        self.counters.buffers_processed += 1;

        let mut input = WordCursor::new(data, Alignment::Word16);

        match self.process_events(buffer_number, &mut input, out) {
            Ok(ProcessorAction::SkipInput) => {
                warn!(
                    "buffer {}: skipping input, {} bytes left",
                    buffer_number,
                    input.bytes_left()
                );
                self.abandon_buffer(&input, out);
                Ok(ProcessorAction::SkipInput)
            }
            Ok(action) => {
                self.check_trailer(buffer_number, &input);

                // Completed events must not wait behind a record that did not
                // leave an event in progress.
                if !self.is_event_in_progress() && out.current_len() > 0 {
                    out.flush();
                }
                Ok(action)
            }
            Err(e) => {
                warn!("buffer {}: end of buffer reached unexpectedly: {}", buffer_number, e);
                self.abandon_buffer(&input, out);
                Err(e)
            }
        }
    }

    fn process_events(
        &mut self,
        buffer_number: u32,
        input: &mut WordCursor<'_>,
        out: &mut OutputBuffers,
    ) -> Result<ProcessorAction, EndOfBuffer> {
        let header = input.extract_u16()?;
        let event_count = header & legacy::BUFFER_EVENT_COUNT_MASK;

        trace!(
            "buffer {}: header=0x{:04x}, events={}, last={}, scaler={}",
            buffer_number,
            header,
            event_count,
            header & legacy::BUFFER_LAST_BUFFER != 0,
            header & legacy::BUFFER_SCALER != 0
        );

        let mut action = ProcessorAction::Continue;

        for event_number in 0..event_count {
            action = self.process_event(buffer_number, input, out, event_number, event_count)?;

            match action {
                ProcessorAction::SkipInput => break,
                ProcessorAction::KeepState => {}
                ProcessorAction::Continue | ProcessorAction::FlushBuffer => {
                    if self.writer.has_open_event_section() {
                        self.discard_event(out);
                    }
                    self.state = ProcessorState::default();
                }
            }

            if action == ProcessorAction::FlushBuffer {
                out.flush();
            }
        }

        Ok(action)
    }

    fn process_event(
        &mut self,
        buffer_number: u32,
        input: &mut WordCursor<'_>,
        out: &mut OutputBuffers,
        event_number: u16,
        event_count: u16,
    ) -> Result<ProcessorAction, EndOfBuffer> {
        let Ok(event_header) = input.extract_u16() else {
            warn!("buffer {}: end of buffer when reading event header", buffer_number);
            return Ok(ProcessorAction::SkipInput);
        };

        let stack_id = ((event_header >> legacy::EVENT_STACK_ID_SHIFT) & legacy::EVENT_STACK_ID_MASK) as u8;
        let partial = event_header & legacy::EVENT_CONTINUATION != 0;
        let len = (event_header & legacy::EVENT_LENGTH_MASK) as usize;

        trace!(
            "buffer {}: event header=0x{:04x}, stack={}, partial={}, len={} shorts",
            buffer_number,
            event_header,
            stack_id,
            partial,
            len
        );

        if len > input.u16_left() {
            warn!(
                "buffer {}: event length {} exceeds the {} shorts left",
                buffer_number,
                len,
                input.u16_left()
            );
            return Ok(ProcessorAction::SkipInput);
        }

        let Some(event_index) = self.readout.event_for_stack(stack_id) else {
            debug!("buffer {}: no event for stack id {}, skipping {} shorts", buffer_number, stack_id, len);
            input.skip(len)?;
            self.counters.unmapped_stack_events += 1;
            self.counters.unused_bytes += (len * 2) as u64;
            return Ok(ProcessorAction::KeepState);
        };

        let mut event = input.split_words(len)?;

        if self.readout.modules(event_index).is_empty() {
            debug!("buffer {}: event {} has no modules, skipping", buffer_number, event_index);
            self.counters.unused_bytes += (len * 2) as u64;
            return Ok(if event_number + 1 == event_count {
                ProcessorAction::FlushBuffer
            } else {
                ProcessorAction::Continue
            });
        }

        match self.state.stack_id {
            None => {
                self.state = ProcessorState {
                    stack_id: Some(stack_id),
                    event_index,
                    was_partial: partial,
                    ..Default::default()
                };
                self.writer.open_event_section(out.current(), event_index as u8);
            }
            Some(current) if current != stack_id => {
                warn!(
                    "buffer {}: stack id changed from {} to {} inside a continued event",
                    buffer_number, current, stack_id
                );
                return Ok(ProcessorAction::SkipInput);
            }
            Some(_) => {}
        }

        let buf = out.current();

        loop {
            let has_data = (self.state.partial_data.is_some() && event.u16_left() > 0) || event.u32_left() > 0;

            if !has_data {
                break;
            }

            if !self.writer.has_open_module_section() {
                let next = self.state.module_index.map_or(0, |mi| mi + 1);

                let Some(type_id) = self.readout.module(event_index, next).map(|m| m.type_id) else {
                    warn!(
                        "buffer {}: module index {} out of range for event {}",
                        buffer_number, next, event_index
                    );
                    return Ok(ProcessorAction::SkipInput);
                };

                self.state.module_index = Some(next);
                self.writer.open_module_section(buf, type_id);
            }

            let data = match self.state.partial_data.take() {
                Some(low) => ((event.extract_u16()? as u32) << 16) | low as u32,
                None => event.extract_u32()?,
            };

            self.writer.write_module_data(buf, data);

            // A data word equal to the marker also ends the module.
            if data == listfile::END_MARKER {
                self.close_module(buf);
            }
        }

        if partial && event.u16_left() == 1 {
            self.state.partial_data = Some(event.extract_u16()?);
        }

        while let Ok(word) = event.peek_u16() {
            if word != legacy::BUFFER_TERMINATOR {
                warn!(
                    "buffer {}: unexpected word 0x{:04x} at end of event, skipping buffer",
                    buffer_number, word
                );
                return Ok(ProcessorAction::SkipInput);
            }
            event.skip(1)?;
        }

        if partial {
            self.state.was_partial = true;
            return Ok(ProcessorAction::KeepState);
        }

        if self.writer.has_open_module_section() {
            self.close_module(buf);
        }

        self.writer.write_event_data(buf, listfile::END_MARKER);
        let flags = self.writer.close_event_section(buf);

        if flags.event_size_exceeded() {
            warn!("buffer {}: event {} truncated at the event size limit", buffer_number, event_index);
            self.counters.truncated_events += 1;
        }

        self.counters.events_written += 1;

        if self.state.was_partial || event_number + 1 == event_count {
            Ok(ProcessorAction::FlushBuffer)
        } else {
            Ok(ProcessorAction::Continue)
        }
    }

    fn close_module(&mut self, buf: &mut DataBuffer) {
        let flags = self.writer.close_module_section(buf);

        if flags.module_size_exceeded() {
            warn!(
                "event {}, module {:?}: module data truncated at the module size limit",
                self.state.event_index, self.state.module_index
            );
            self.counters.truncated_modules += 1;
        }
    }

    /// Drop the event in progress and deliver whatever completed events the
    /// output buffer already holds
    fn abandon_buffer(&mut self, input: &WordCursor<'_>, out: &mut OutputBuffers) {
        self.counters.buffers_with_errors += 1;
        self.counters.unused_bytes += input.bytes_left() as u64;
        self.discard_event(out);
        out.flush_if_not_empty();
    }

    /// Everything after the last event record must be terminator words
    fn check_trailer(&mut self, buffer_number: u32, input: &WordCursor<'_>) {
        let rest = input.remaining();
        let terminators = rest
            .chunks_exact(2)
            .take_while(|pair| u16::from_le_bytes([pair[0], pair[1]]) == legacy::BUFFER_TERMINATOR)
            .count();
        let unexpected = &rest[terminators * 2..];

        if !unexpected.is_empty() {
            warn!(
                "buffer {}: {} unexpected bytes after the last event: {}",
                buffer_number,
                unexpected.len(),
                hex::encode(unexpected)
            );
            self.counters.unused_bytes += unexpected.len() as u64;
        }
    }
}
