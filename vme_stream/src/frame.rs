/*!
Framed-stack header decoding.

This module decodes the 32-bit frame headers of the framed-stack protocol,
the system event headers injected by the readout software, and the two
Ethernet payload headers every readout packet starts with. It also provides
the wraparound-safe buffer and packet loss arithmetic used by the parser.
*/

use serde::{Deserialize, Serialize};

use crate::protocol::{eth, frame, system_event};

/// Frame type values found in bits 31..24 of a frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    SuperFrame = frame::SUPER_FRAME,
    StackFrame = frame::STACK_FRAME,
    BlockRead = frame::BLOCK_READ,
    StackError = frame::STACK_ERROR,
    StackContinuation = frame::STACK_CONTINUATION,
    SystemEvent = frame::SYSTEM_EVENT,
}

impl FrameType {
    /// Parse a frame type from its header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            frame::SUPER_FRAME => Some(Self::SuperFrame),
            frame::STACK_FRAME => Some(Self::StackFrame),
            frame::BLOCK_READ => Some(Self::BlockRead),
            frame::STACK_ERROR => Some(Self::StackError),
            frame::STACK_CONTINUATION => Some(Self::StackContinuation),
            frame::SYSTEM_EVENT => Some(Self::SystemEvent),
            _ => None,
        }
    }

    /// Check if this frame carries stack (event) data
    pub fn is_stack_header(self) -> bool {
        matches!(self, Self::StackFrame | Self::StackContinuation)
    }
}

/// The four flag bits of a frame header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub fn timeout(self) -> bool {
        self.0 & frame::FLAG_TIMEOUT != 0
    }

    pub fn bus_error(self) -> bool {
        self.0 & frame::FLAG_BUS_ERROR != 0
    }

    pub fn syntax_error(self) -> bool {
        self.0 & frame::FLAG_SYNTAX_ERROR != 0
    }

    /// Set when the frame is continued by a following frame of the same kind
    pub fn continues(self) -> bool {
        self.0 & frame::FLAG_CONTINUE != 0
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_type: u8,
    pub flags: FrameFlags,
    pub stack: u8,
    pub ctrl: u8,
    /// Number of words following the header
    pub len: u16,
}

impl FrameInfo {
    pub fn from_header(header: u32) -> Self {
        Self {
            frame_type: ((header >> frame::TYPE_SHIFT) & frame::TYPE_MASK) as u8,
            flags: FrameFlags(((header >> frame::FLAGS_SHIFT) & frame::FLAGS_MASK) as u8),
            stack: ((header >> frame::STACK_SHIFT) & frame::STACK_MASK) as u8,
            ctrl: ((header >> frame::CTRL_SHIFT) & frame::CTRL_MASK) as u8,
            len: ((header >> frame::LENGTH_SHIFT) & frame::LENGTH_MASK) as u16,
        }
    }

    pub fn kind(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }

    /// Encode the header word. Fields wider than their bit range are masked.
    pub fn to_header(&self) -> u32 {
        ((self.frame_type as u32 & frame::TYPE_MASK) << frame::TYPE_SHIFT)
            | ((self.flags.0 as u32 & frame::FLAGS_MASK) << frame::FLAGS_SHIFT)
            | ((self.stack as u32 & frame::STACK_MASK) << frame::STACK_SHIFT)
            | ((self.ctrl as u32 & frame::CTRL_MASK) << frame::CTRL_SHIFT)
            | ((self.len as u32 & frame::LENGTH_MASK) << frame::LENGTH_SHIFT)
    }
}

/// Build a frame header word from its parts
pub fn make_frame_header(frame_type: FrameType, flags: u8, stack: u8, len: u16) -> u32 {
    FrameInfo {
        frame_type: frame_type as u8,
        flags: FrameFlags(flags),
        stack,
        ctrl: 0,
        len,
    }
    .to_header()
}

pub fn frame_type_of(header: u32) -> u8 {
    ((header >> frame::TYPE_SHIFT) & frame::TYPE_MASK) as u8
}

/// Decoded system event header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemEventHeader {
    pub subtype: u8,
    pub continued: bool,
    pub len: u16,
}

impl SystemEventHeader {
    /// Decode a system event header, `None` if the word is not one
    pub fn from_header(header: u32) -> Option<Self> {
        if frame_type_of(header) != frame::SYSTEM_EVENT {
            return None;
        }

        Some(Self {
            subtype: ((header >> system_event::SUBTYPE_SHIFT) & system_event::SUBTYPE_MASK) as u8,
            continued: (header >> system_event::CONTINUE_SHIFT) & system_event::CONTINUE_MASK != 0,
            len: (header & system_event::LENGTH_MASK) as u16,
        })
    }

    pub fn to_header(&self) -> u32 {
        ((frame::SYSTEM_EVENT as u32) << frame::TYPE_SHIFT)
            | ((self.continued as u32) << system_event::CONTINUE_SHIFT)
            | ((self.subtype as u32 & system_event::SUBTYPE_MASK) << system_event::SUBTYPE_SHIFT)
            | (self.len as u32 & system_event::LENGTH_MASK)
    }
}

/// Subtypes produced by the readout software itself
pub fn is_known_subtype(subtype: u8) -> bool {
    matches!(
        subtype,
        system_event::ENDIAN_MARKER
            | system_event::VME_CONFIG
            | system_event::UNIX_TIMESTAMP
            | system_event::PAUSE
            | system_event::RESUME
            | system_event::END_OF_FILE
    )
}

/// A system event header with one of the known subtypes
pub fn is_known_system_event(header: u32) -> bool {
    SystemEventHeader::from_header(header).is_some_and(|h| is_known_subtype(h.subtype))
}

/// Human readable name of a system event subtype
pub fn system_event_type_name(subtype: u8) -> &'static str {
    match subtype {
        system_event::ENDIAN_MARKER => "EndianMarker",
        system_event::VME_CONFIG => "VMEConfig",
        system_event::UNIX_TIMESTAMP => "UnixTimestamp",
        system_event::PAUSE => "Pause",
        system_event::RESUME => "Resume",
        system_event::END_OF_FILE => "EndOfFile",
        _ => "unknown/custom",
    }
}

/// The two Ethernet payload header words at the start of each readout packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub header0: u32,
    pub header1: u32,
}

impl PayloadHeader {
    pub fn new(header0: u32, header1: u32) -> Self {
        Self { header0, header1 }
    }

    pub fn packet_channel(&self) -> u8 {
        ((self.header0 >> eth::PACKET_CHANNEL_SHIFT) & eth::PACKET_CHANNEL_MASK) as u8
    }

    pub fn packet_number(&self) -> u16 {
        ((self.header0 >> eth::PACKET_NUMBER_SHIFT) & eth::PACKET_NUMBER_MASK) as u16
    }

    /// Payload words following the two header words
    pub fn data_word_count(&self) -> u16 {
        (self.header0 & eth::DATA_WORD_COUNT_MASK) as u16
    }

    pub fn udp_timestamp(&self) -> u32 {
        (self.header1 >> eth::TIMESTAMP_SHIFT) & eth::TIMESTAMP_MASK
    }

    /// Offset in words, counted from the first payload word, of the first
    /// frame header inside this packet
    pub fn next_header_pointer(&self) -> u16 {
        (self.header1 & eth::NEXT_HEADER_POINTER_MASK) as u16
    }

    pub fn is_next_header_pointer_present(&self) -> bool {
        self.next_header_pointer() != eth::NO_HEADER_POINTER_PRESENT
    }

    /// Packet words including the two header words
    pub fn packet_words(&self) -> usize {
        eth::HEADER_WORDS + self.data_word_count() as usize
    }

    pub fn encode(channel: u8, packet_number: u16, data_words: u16, next_header_pointer: u16) -> Self {
        let header0 = ((channel as u32 & eth::PACKET_CHANNEL_MASK) << eth::PACKET_CHANNEL_SHIFT)
            | ((packet_number as u32 & eth::PACKET_NUMBER_MASK) << eth::PACKET_NUMBER_SHIFT)
            | (data_words as u32 & eth::DATA_WORD_COUNT_MASK);
        let header1 = next_header_pointer as u32 & eth::NEXT_HEADER_POINTER_MASK;
        Self { header0, header1 }
    }
}

/// Number of buffers lost between `last_buffer_number` and `buffer_number`.
///
/// Computed modulo 2^32 so the counter may wrap. Equal numbers count as a
/// full wrap.
pub fn calc_buffer_loss(buffer_number: u32, last_buffer_number: u32) -> u32 {
    buffer_number.wrapping_sub(last_buffer_number).wrapping_sub(1)
}

/// Number of packets lost between two 12-bit packet numbers.
pub fn calc_packet_loss(last_packet_number: u16, packet_number: u16) -> u32 {
    const PACKET_NUMBER_MAX: i32 = eth::PACKET_NUMBER_MASK as i32;

    let diff = packet_number as i32 - last_packet_number as i32;

    if diff < 1 {
        (PACKET_NUMBER_MAX + diff) as u32
    } else {
        (diff - 1) as u32
    }
}
