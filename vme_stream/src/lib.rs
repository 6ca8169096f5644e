/*!
# VME Readout Stream Reassembly

This crate turns raw, possibly lossy buffers produced by VME controllers into a
well-formed sequence of events made of per-module data sections.

Two controller families are handled:

- the framed-stack protocol, delivered either as Ethernet packets or as bulk
  USB buffers ([`framed_parser`])
- the legacy 16-bit aligned protocol, where a 32-bit data word may be split
  across two physical buffers ([`legacy`])

## Core Types

- [`WordCursor`] - Bounds-checked reads over raw buffers
- [`ReadoutInfo`] - Per event, per module prefix/dynamic/suffix layout
- [`StreamWriter`] - Event/module section writer with size ceilings
- [`ReadoutParserState`] - Cross-buffer state of the framed-stack parser
- [`LegacyProcessor`] - Cross-buffer state of the legacy buffer processor
- [`ReadoutEngine`] - Per-buffer dispatch feeding the output buffer queue

## Modules

- [`cursor`] - Word cursor
- [`frame`] - Frame header decoding and loss arithmetic
- [`readout_info`] - Readout layout built from module readout programs
- [`stream_writer`] - Output section layout
- [`framed_parser`] - Framed-stack parser (ETH and USB)
- [`legacy`] - Legacy buffer processor
- [`buffer_queue`] - Free/filled output buffer queues
- [`counters`] - Run counters and snapshots
- [`engine`] - Format dispatch and output plumbing
- [`error`] - Error types
*/

pub mod buffer_queue;
pub mod counters;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod frame;
pub mod framed_parser;
pub mod legacy;
pub mod readout_info;
pub mod stream_writer;

// Re-export commonly used types
pub use buffer_queue::{BufferQueues, FilledBuffers, OutputBuffers};
pub use counters::{CounterHandle, CounterSnapshot, LegacyCounters, ParserCounters};
pub use cursor::{Alignment, WordCursor};
pub use engine::{BufferFormat, EngineConfig, RawBuffer, ReadoutEngine};
pub use error::{EndOfBuffer, ModuleProgramError, ReadoutInfoError, Result, StreamError};
pub use frame::{FrameFlags, FrameInfo, FrameType, PayloadHeader, SystemEventHeader};
pub use framed_parser::{FramedTransport, ParseResult, ReadoutCallbacks, ReadoutParserState};
pub use legacy::{LegacyProcessor, ProcessorAction};
pub use readout_info::{EventConfig, ModuleConfig, ModuleReadoutInfo, ReadoutCommand, ReadoutInfo};
pub use stream_writer::{DataBuffer, SectionIter, StreamWriter, WriteFlags, WriterLimits};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Framed-stack frame headers. All headers are 32 bit wide.
    pub mod frame {
        pub const TYPE_SHIFT: u32 = 24;
        pub const TYPE_MASK: u32 = 0xff;

        pub const FLAGS_SHIFT: u32 = 20;
        pub const FLAGS_MASK: u32 = 0xf;

        pub const STACK_SHIFT: u32 = 16;
        pub const STACK_MASK: u32 = 0xf;

        pub const CTRL_SHIFT: u32 = 13;
        pub const CTRL_MASK: u32 = 0x7;

        pub const LENGTH_SHIFT: u32 = 0;
        pub const LENGTH_MASK: u32 = 0x1fff;

        pub const SUPER_FRAME: u8 = 0xf1;
        pub const STACK_FRAME: u8 = 0xf3;
        pub const BLOCK_READ: u8 = 0xf5;
        pub const STACK_ERROR: u8 = 0xf7;
        pub const STACK_CONTINUATION: u8 = 0xf9;
        pub const SYSTEM_EVENT: u8 = 0xfa;

        pub const FLAG_TIMEOUT: u8 = 1 << 0;
        pub const FLAG_BUS_ERROR: u8 = 1 << 1;
        pub const FLAG_SYNTAX_ERROR: u8 = 1 << 2;
        pub const FLAG_CONTINUE: u8 = 1 << 3;
    }

    /// Software generated system event frames embedded in the readout stream.
    pub mod system_event {
        pub const CONTINUE_SHIFT: u32 = 23;
        pub const CONTINUE_MASK: u32 = 0b1;

        pub const SUBTYPE_SHIFT: u32 = 13;
        pub const SUBTYPE_MASK: u32 = 0x7f;

        pub const LENGTH_MASK: u32 = 0x1fff;

        pub const ENDIAN_MARKER: u8 = 0x01;
        pub const VME_CONFIG: u8 = 0x10;
        pub const UNIX_TIMESTAMP: u8 = 0x11;
        pub const PAUSE: u8 = 0x12;
        pub const RESUME: u8 = 0x13;
        pub const END_OF_FILE: u8 = 0x77;
        pub const SUBTYPE_MAX: u8 = 0x7f;

        /// Number of distinct subtype values, used to size per-subtype counters.
        pub const SUBTYPE_COUNT: usize = SUBTYPE_MAX as usize + 1;

        pub const ENDIAN_MARKER_VALUE: u32 = 0x1234_5678;
    }

    /// Ethernet payload header pair prepended to every readout packet.
    pub mod eth {
        pub const HEADER_WORDS: usize = 2;

        pub const PACKET_CHANNEL_SHIFT: u32 = 28;
        pub const PACKET_CHANNEL_MASK: u32 = 0b11;

        pub const PACKET_NUMBER_SHIFT: u32 = 16;
        pub const PACKET_NUMBER_MASK: u32 = 0xfff;

        pub const DATA_WORD_COUNT_MASK: u32 = 0x1fff;

        pub const TIMESTAMP_SHIFT: u32 = 12;
        pub const TIMESTAMP_MASK: u32 = 0xf_ffff;

        pub const NEXT_HEADER_POINTER_MASK: u32 = 0xfff;
        pub const NO_HEADER_POINTER_PRESENT: u16 = 0xfff;

        pub const CHANNEL_COMMAND: u8 = 0;
        pub const CHANNEL_STACK: u8 = 1;
        pub const CHANNEL_DATA: u8 = 2;
    }

    /// Legacy 16-bit aligned controller buffers.
    pub mod legacy {
        pub const BUFFER_LAST_BUFFER: u16 = 0x8000;
        pub const BUFFER_SCALER: u16 = 0x4000;
        pub const BUFFER_CONTINUOUS_MODE: u16 = 0x2000;
        pub const BUFFER_MULTI_BUFFER: u16 = 0x1000;
        pub const BUFFER_EVENT_COUNT_MASK: u16 = 0x0fff;

        pub const EVENT_STACK_ID_SHIFT: u16 = 13;
        pub const EVENT_STACK_ID_MASK: u16 = 0x7;
        pub const EVENT_CONTINUATION: u16 = 0x1000;
        pub const EVENT_LENGTH_MASK: u16 = 0x0fff;

        pub const STACK_ID_MAX: u8 = 7;

        pub const BUFFER_TERMINATOR: u16 = 0xffff;
    }

    /// Output section layout shared by the stream writer and its readers.
    pub mod listfile {
        pub const SECTION_TYPE_SHIFT: u32 = 29;
        pub const SECTION_TYPE_MASK: u32 = 0xe000_0000;

        pub const SECTION_CONFIG: u32 = 0;
        pub const SECTION_EVENT: u32 = 1;
        pub const SECTION_END: u32 = 2;

        pub const EVENT_INDEX_SHIFT: u32 = 16;
        pub const EVENT_INDEX_MASK: u32 = 0x000f_0000;

        pub const SECTION_SIZE_MASK: u32 = 0x0000_ffff;
        pub const SECTION_MAX_WORDS: u32 = SECTION_SIZE_MASK;

        pub const MODULE_TYPE_SHIFT: u32 = 12;
        pub const MODULE_TYPE_MASK: u32 = 0x0003_f000;

        pub const MODULE_SIZE_MASK: u32 = 0x0000_03ff;
        pub const MODULE_MAX_WORDS: u32 = MODULE_SIZE_MASK;

        pub const MAX_EVENTS: usize = 16;
        pub const MAX_MODULE_TYPE: u8 = 63;

        /// Literal word terminating module sections and event sections.
        pub const END_MARKER: u32 = 0x8765_4321;
    }
}
