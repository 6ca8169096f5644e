/*!
Free and filled output buffer queues.

A fixed set of [`DataBuffer`]s circulates between the readout side and the
consumer side over two bounded crossbeam channels. The readout side never
blocks for longer than the configured timeout: when no free buffer shows up
in time it writes into a local scratch buffer whose contents are dropped on
flush.
*/

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::stream_writer::DataBuffer;

/// Where the output buffer currently being written came from
#[derive(Debug)]
enum CurrentBuffer {
    Queued(DataBuffer),
    Scratch,
}

/// Both ends of a freshly created buffer pool
pub struct BufferQueues {
    pub output: OutputBuffers,
    pub filled: FilledBuffers,
}

impl BufferQueues {
    /// Create `count` buffers of `capacity` bytes each, all initially free
    pub fn new(count: usize, capacity: usize, free_timeout: Duration) -> Self {
        let count = count.max(1);
        let (free_tx, free_rx) = bounded(count);
        let (filled_tx, filled_rx) = bounded(count);

        for _ in 0..count {
            // The channel has room for exactly `count` buffers.
            let _ = free_tx.try_send(DataBuffer::with_capacity(capacity));
        }

        Self {
            output: OutputBuffers {
                free_rx,
                free_tx: free_tx.clone(),
                filled_tx,
                current: None,
                scratch: DataBuffer::with_capacity(capacity),
                free_timeout,
                buffers_flushed: 0,
                bytes_flushed: 0,
                dropped_buffers: 0,
            },
            filled: FilledBuffers { filled_rx, free_tx },
        }
    }

    pub fn split(self) -> (OutputBuffers, FilledBuffers) {
        (self.output, self.filled)
    }
}

/// Readout side of the buffer pool
pub struct OutputBuffers {
    free_rx: Receiver<DataBuffer>,
    free_tx: Sender<DataBuffer>,
    filled_tx: Sender<DataBuffer>,
    current: Option<CurrentBuffer>,
    scratch: DataBuffer,
    free_timeout: Duration,
    buffers_flushed: u64,
    bytes_flushed: u64,
    dropped_buffers: u64,
}

impl OutputBuffers {
    /// The buffer output is currently written to. Acquires a free buffer
    /// first if none is held.
    pub fn current(&mut self) -> &mut DataBuffer {
        if self.current.is_none() {
            let acquired = match self.free_rx.recv_timeout(self.free_timeout) {
                Ok(mut buffer) => {
                    buffer.clear();
                    CurrentBuffer::Queued(buffer)
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("no free output buffer within {:?}, using scratch buffer", self.free_timeout);
                    self.scratch.clear();
                    CurrentBuffer::Scratch
                }
            };
            self.current = Some(acquired);
        }

        match &mut self.current {
            Some(CurrentBuffer::Queued(buffer)) => buffer,
            _ => &mut self.scratch,
        }
    }

    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// True if the held buffer is the scratch fallback
    pub fn is_scratch(&self) -> bool {
        matches!(self.current, Some(CurrentBuffer::Scratch))
    }

    /// Bytes written to the held buffer, 0 if none is held
    pub fn current_len(&self) -> usize {
        match &self.current {
            Some(CurrentBuffer::Queued(buffer)) => buffer.len(),
            Some(CurrentBuffer::Scratch) => self.scratch.len(),
            None => 0,
        }
    }

    /// Hand the held buffer to the consumer. Scratch contents are dropped and
    /// counted instead. Returns true if data reached the consumer.
    pub fn flush(&mut self) -> bool {
        match self.current.take() {
            Some(CurrentBuffer::Queued(buffer)) => {
                let len = buffer.len() as u64;
                match self.filled_tx.try_send(buffer) {
                    Ok(()) => {
                        self.buffers_flushed += 1;
                        self.bytes_flushed += len;
                        true
                    }
                    Err(e) => {
                        warn!("output consumer unavailable, dropping {} bytes", len);
                        self.dropped_buffers += 1;
                        let mut buffer = e.into_inner();
                        buffer.clear();
                        let _ = self.free_tx.try_send(buffer);
                        false
                    }
                }
            }
            Some(CurrentBuffer::Scratch) => {
                self.scratch.clear();
                self.dropped_buffers += 1;
                false
            }
            None => false,
        }
    }

    /// Flush the held buffer if it contains data, otherwise release it
    pub fn flush_if_not_empty(&mut self) -> bool {
        if self.current_len() > 0 {
            self.flush()
        } else {
            self.release();
            false
        }
    }

    /// Return the held buffer to the free queue without delivering it
    pub fn release(&mut self) {
        match self.current.take() {
            Some(CurrentBuffer::Queued(mut buffer)) => {
                buffer.clear();
                let _ = self.free_tx.try_send(buffer);
            }
            Some(CurrentBuffer::Scratch) => self.scratch.clear(),
            None => {}
        }
    }

    pub fn buffers_flushed(&self) -> u64 {
        self.buffers_flushed
    }

    pub fn bytes_flushed(&self) -> u64 {
        self.bytes_flushed
    }

    pub fn dropped_buffers(&self) -> u64 {
        self.dropped_buffers
    }
}

/// Consumer side of the buffer pool
#[derive(Clone)]
pub struct FilledBuffers {
    filled_rx: Receiver<DataBuffer>,
    free_tx: Sender<DataBuffer>,
}

impl FilledBuffers {
    /// Wait for the next filled buffer
    pub fn recv_timeout(&self, timeout: Duration) -> Result<DataBuffer, RecvTimeoutError> {
        self.filled_rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<DataBuffer> {
        self.filled_rx.try_recv().ok()
    }

    /// Hand a consumed buffer back to the readout side
    pub fn recycle(&self, mut buffer: DataBuffer) {
        buffer.clear();
        if self.free_tx.try_send(buffer).is_err() {
            debug!("free queue full or closed, dropping recycled buffer");
        }
    }

    /// Filled buffers waiting to be consumed
    pub fn pending(&self) -> usize {
        self.filled_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(count: usize) -> (OutputBuffers, FilledBuffers) {
        BufferQueues::new(count, 64, Duration::from_millis(5)).split()
    }

    #[test]
    fn test_flush_delivers_buffer() {
        let (mut output, filled) = queues(2);

        output.current().push_u32(0xdead_beef);
        assert!(output.flush());
        assert!(!output.has_current());

        let buffer = filled.try_recv().unwrap();
        assert_eq!(buffer.word_at(0), Some(0xdead_beef));
        assert_eq!(output.buffers_flushed(), 1);
        assert_eq!(output.bytes_flushed(), 4);
        assert_eq!(output.dropped_buffers(), 0);
    }

    #[test]
    fn test_scratch_fallback_drops_data() {
        let (mut output, filled) = queues(1);

        output.current().push_u32(1);
        assert!(output.flush());

        // The only buffer is held by the consumer now.
        output.current().push_u32(2);
        assert!(output.is_scratch());
        assert!(!output.flush());
        assert_eq!(output.dropped_buffers(), 1);
        assert_eq!(filled.pending(), 1);

        // Once recycled the queue buffer is used again.
        let buffer = filled.try_recv().unwrap();
        filled.recycle(buffer);
        output.current().push_u32(3);
        assert!(!output.is_scratch());
        assert!(output.flush());
        assert_eq!(filled.try_recv().unwrap().word_at(0), Some(3));
    }

    #[test]
    fn test_release_returns_buffer_unchanged() {
        let (mut output, filled) = queues(1);

        output.current().push_u32(7);
        output.release();
        assert!(filled.try_recv().is_none());

        assert!(output.current().is_empty());
        assert!(!output.is_scratch());
    }

    #[test]
    fn test_flush_if_not_empty() {
        let (mut output, filled) = queues(1);

        output.current();
        assert!(!output.flush_if_not_empty());
        assert_eq!(filled.pending(), 0);

        output.current().push_u32(9);
        assert!(output.flush_if_not_empty());
        assert_eq!(filled.pending(), 1);
    }
}
