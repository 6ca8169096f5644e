/*!
Per-run counters.

The parsers own their counters and increment them in place. Consumers never
touch those directly: the engine publishes copies into a [`CounterHandle`]
after each buffer, using `try_lock` so the readout thread never waits on a
reader.
*/

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::framed_parser::ParseResult;
use crate::protocol::system_event;

/// Counters of the framed-stack parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParserCounters {
    pub internal_buffer_loss: u64,
    pub buffers_processed: u64,
    pub unused_bytes: u64,
    pub eth_packet_loss: u64,
    pub eth_packets_processed: u64,
    pub events_completed: u64,
    /// Indexed by system event subtype
    pub system_event_types: Vec<u64>,
    /// Indexed by `ParseResult as usize`
    pub parse_results: Vec<u64>,
    /// Buffers or packets abandoned because a frame ran past their end
    pub end_of_buffer_errors: u64,
}

impl ParserCounters {
    pub fn new() -> Self {
        Self {
            internal_buffer_loss: 0,
            buffers_processed: 0,
            unused_bytes: 0,
            eth_packet_loss: 0,
            eth_packets_processed: 0,
            events_completed: 0,
            system_event_types: vec![0; system_event::SUBTYPE_COUNT],
            parse_results: vec![0; ParseResult::COUNT],
            end_of_buffer_errors: 0,
        }
    }

    pub fn count_parse_result(&mut self, result: ParseResult) {
        self.parse_results[result as usize] += 1;
    }

    pub fn parse_result_count(&self, result: ParseResult) -> u64 {
        self.parse_results[result as usize]
    }

    /// Sum of all non-Ok parse results
    pub fn parse_errors(&self) -> u64 {
        ParseResult::ALL
            .iter()
            .filter(|pr| !pr.is_ok())
            .map(|&pr| self.parse_result_count(pr))
            .sum()
    }
}

impl Default for ParserCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters of the legacy buffer processor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LegacyCounters {
    pub buffers_processed: u64,
    pub buffers_with_errors: u64,
    pub internal_buffer_loss: u64,
    pub events_written: u64,
    pub unmapped_stack_events: u64,
    pub unused_bytes: u64,
    pub truncated_modules: u64,
    pub truncated_events: u64,
}

/// Counters of the output side of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputCounters {
    pub buffers_flushed: u64,
    pub bytes_flushed: u64,
    /// Output buffers lost because no free buffer was available in time
    pub dropped_buffers: u64,
    /// Framed-stack modules and events cut at a size ceiling
    pub truncated_modules: u64,
    pub truncated_events: u64,
}

/// A consistent copy of every counter of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub parser: ParserCounters,
    pub legacy: LegacyCounters,
    pub output: OutputCounters,
}

/// Shared, read-mostly view of the run counters
#[derive(Debug, Clone, Default)]
pub struct CounterHandle {
    inner: Arc<Mutex<CounterSnapshot>>,
}

impl CounterHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the most recently published counters
    pub fn snapshot(&self) -> CounterSnapshot {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Publish new counter values unless a reader currently holds the lock.
    /// Returns whether the values were stored.
    pub fn try_publish(&self, snapshot: &CounterSnapshot) -> bool {
        match self.inner.try_lock() {
            Ok(mut guard) => {
                guard.clone_from(snapshot);
                true
            }
            Err(_) => false,
        }
    }

    /// Publish new counter values, waiting for readers if needed
    pub fn publish(&self, snapshot: &CounterSnapshot) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone_from(snapshot);
    }
}
