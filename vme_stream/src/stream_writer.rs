/*!
Output section writer.

Reassembled events are written as event sections containing module sections:

```text
event header  [type:3 | .. | event index:4 | size:16]
  module header [.. | type id:6 | .. | size:10]
  module data words...
  ...
  event data words (trailing END_MARKER)
```

Sizes count the 32-bit words following the header. Headers are written with
a zero size and patched when the section is closed, so only the offsets of the
currently open sections are tracked.
*/

use std::ops::BitOr;

use serde::Serialize;

use crate::error::{Result, StreamError};
use crate::protocol::listfile;

/// Growable little-endian output buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBuffer {
    bytes: Vec<u8>,
}

impl DataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bytes),
        }
    }

    /// Used size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn push_u32(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    pub fn word_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.bytes.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrite a previously written word. Returns false if `offset` does
    /// not address a complete word.
    pub fn set_word_at(&mut self, offset: usize, word: u32) -> bool {
        match offset
            .checked_add(4)
            .and_then(|end| self.bytes.get_mut(offset..end))
        {
            Some(slot) => {
                slot.copy_from_slice(&word.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// All complete words in the buffer
    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        le_words(&self.bytes)
    }
}

fn le_words(bytes: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

/// Sticky truncation flags of the currently open sections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags(u8);

impl WriteFlags {
    pub const NONE: Self = Self(0);
    pub const MODULE_SIZE_EXCEEDED: Self = Self(1 << 0);
    pub const EVENT_SIZE_EXCEEDED: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn module_size_exceeded(self) -> bool {
        self.contains(Self::MODULE_SIZE_EXCEEDED)
    }

    pub fn event_size_exceeded(self) -> bool {
        self.contains(Self::EVENT_SIZE_EXCEEDED)
    }
}

impl BitOr for WriteFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-section size ceilings in words, clamped to the header field widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriterLimits {
    pub max_module_words: u32,
    pub max_event_words: u32,
}

impl WriterLimits {
    pub fn new(max_module_words: u32, max_event_words: u32) -> Self {
        Self {
            max_module_words: max_module_words.min(listfile::MODULE_MAX_WORDS),
            max_event_words: max_event_words.min(listfile::SECTION_MAX_WORDS),
        }
    }
}

impl Default for WriterLimits {
    fn default() -> Self {
        Self::new(listfile::MODULE_MAX_WORDS, listfile::SECTION_MAX_WORDS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModuleSection {
    Closed,
    Open { header_offset: usize },
    /// The event had no room for the module header; data is discarded
    Dropped,
}

/// Writes event and module sections into a caller supplied [`DataBuffer`].
///
/// The writer only holds offsets and counters, so it may outlive the buffer
/// it writes into as long as the same buffer is passed until the event
/// section is closed.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    limits: WriterLimits,
    event_header_offset: Option<usize>,
    module: ModuleSection,
    event_words: u32,
    module_words: u32,
    flags: WriteFlags,
}

impl StreamWriter {
    pub fn new(limits: WriterLimits) -> Self {
        Self {
            limits,
            event_header_offset: None,
            module: ModuleSection::Closed,
            event_words: 0,
            module_words: 0,
            flags: WriteFlags::NONE,
        }
    }

    pub fn limits(&self) -> WriterLimits {
        self.limits
    }

    pub fn flags(&self) -> WriteFlags {
        self.flags
    }

    pub fn has_open_event_section(&self) -> bool {
        self.event_header_offset.is_some()
    }

    pub fn has_open_module_section(&self) -> bool {
        self.module != ModuleSection::Closed
    }

    /// Byte offset of the open event section's header
    pub fn event_start(&self) -> Option<usize> {
        self.event_header_offset
    }

    /// Forget all open sections without touching the buffer
    pub fn reset(&mut self) {
        self.event_header_offset = None;
        self.module = ModuleSection::Closed;
        self.event_words = 0;
        self.module_words = 0;
        self.flags = WriteFlags::NONE;
    }

    /// Start a new event section. An event section that is still open is
    /// closed first.
    pub fn open_event_section(&mut self, buf: &mut DataBuffer, event_index: u8) -> WriteFlags {
        if self.has_open_event_section() {
            self.close_event_section(buf);
        }

        let header = (listfile::SECTION_EVENT << listfile::SECTION_TYPE_SHIFT)
            | (((event_index as u32) << listfile::EVENT_INDEX_SHIFT) & listfile::EVENT_INDEX_MASK);

        self.event_header_offset = Some(buf.len());
        buf.push_u32(header);
        self.event_words = 0;
        self.flags = WriteFlags::NONE;
        self.flags
    }

    /// Start a new module section inside the open event section
    pub fn open_module_section(&mut self, buf: &mut DataBuffer, module_type: u8) -> WriteFlags {
        if self.has_open_module_section() {
            self.close_module_section(buf);
        }

        self.module_words = 0;
        self.flags = WriteFlags(self.flags.0 & !WriteFlags::MODULE_SIZE_EXCEEDED.0);

        if !self.has_open_event_section() || self.event_words >= self.limits.max_event_words {
            self.flags.insert(WriteFlags::EVENT_SIZE_EXCEEDED);
            self.module = ModuleSection::Dropped;
            return self.flags;
        }

        let header = ((module_type as u32) << listfile::MODULE_TYPE_SHIFT) & listfile::MODULE_TYPE_MASK;

        self.module = ModuleSection::Open {
            header_offset: buf.len(),
        };
        buf.push_u32(header);
        self.event_words += 1;
        self.flags
    }

    /// Append one data word to the open module section. Words beyond either
    /// ceiling are dropped and the matching flag is set.
    pub fn write_module_data(&mut self, buf: &mut DataBuffer, word: u32) -> WriteFlags {
        match self.module {
            ModuleSection::Open { .. } => {}
            ModuleSection::Dropped => {
                self.flags.insert(WriteFlags::EVENT_SIZE_EXCEEDED);
                return self.flags;
            }
            ModuleSection::Closed => {
                self.flags.insert(WriteFlags::MODULE_SIZE_EXCEEDED);
                return self.flags;
            }
        }

        if self.module_words >= self.limits.max_module_words {
            self.flags.insert(WriteFlags::MODULE_SIZE_EXCEEDED);
        } else if self.event_words >= self.limits.max_event_words {
            self.flags.insert(WriteFlags::EVENT_SIZE_EXCEEDED);
        } else {
            buf.push_u32(word);
            self.module_words += 1;
            self.event_words += 1;
        }

        self.flags
    }

    /// Append words to the open module section
    pub fn write_module_words(&mut self, buf: &mut DataBuffer, words: &[u32]) -> WriteFlags {
        for &word in words {
            self.write_module_data(buf, word);
        }
        self.flags
    }

    /// Append an event-level word outside of any module section
    pub fn write_event_data(&mut self, buf: &mut DataBuffer, word: u32) -> WriteFlags {
        if self.has_open_module_section() {
            self.close_module_section(buf);
        }

        if !self.has_open_event_section() || self.event_words >= self.limits.max_event_words {
            self.flags.insert(WriteFlags::EVENT_SIZE_EXCEEDED);
        } else {
            buf.push_u32(word);
            self.event_words += 1;
        }

        self.flags
    }

    /// Patch the module header size and close the section. Returns the flags
    /// accumulated while the section was open.
    pub fn close_module_section(&mut self, buf: &mut DataBuffer) -> WriteFlags {
        if let ModuleSection::Open { header_offset } = self.module {
            if let Some(header) = buf.word_at(header_offset) {
                let header = (header & !listfile::MODULE_SIZE_MASK)
                    | (self.module_words & listfile::MODULE_SIZE_MASK);
                buf.set_word_at(header_offset, header);
            }
        }

        self.module = ModuleSection::Closed;
        self.module_words = 0;
        self.flags
    }

    /// Close any open module section, patch the event header size and close
    /// the event section. Returns the flags accumulated by the event.
    pub fn close_event_section(&mut self, buf: &mut DataBuffer) -> WriteFlags {
        if self.has_open_module_section() {
            self.close_module_section(buf);
        }

        if let Some(offset) = self.event_header_offset.take() {
            if let Some(header) = buf.word_at(offset) {
                let header = (header & !listfile::SECTION_SIZE_MASK)
                    | (self.event_words & listfile::SECTION_SIZE_MASK);
                buf.set_word_at(offset, header);
            }
        }

        let flags = self.flags;
        self.event_words = 0;
        self.flags = WriteFlags::NONE;
        flags
    }
}

impl Default for StreamWriter {
    fn default() -> Self {
        Self::new(WriterLimits::default())
    }
}

/// Module section read back from an output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSectionRef<'a> {
    pub type_id: u8,
    data: &'a [u8],
}

impl<'a> ModuleSectionRef<'a> {
    pub fn words(&self) -> impl Iterator<Item = u32> + 'a {
        le_words(self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Event section read back from an output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSectionRef<'a> {
    pub section_type: u8,
    pub event_index: u8,
    body: &'a [u8],
}

impl<'a> EventSectionRef<'a> {
    /// Section body words (module headers, module data, event data)
    pub fn words(&self) -> impl Iterator<Item = u32> + 'a {
        le_words(self.body)
    }

    /// Split the body into module sections. Iteration stops at the trailing
    /// end marker.
    pub fn modules(&self) -> Result<Vec<ModuleSectionRef<'a>>> {
        let mut modules = Vec::new();
        let mut rest = self.body;

        while rest.len() >= 4 {
            let header = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);

            if header == listfile::END_MARKER {
                break;
            }

            let size = (header & listfile::MODULE_SIZE_MASK) as usize * 4;
            let data = rest.get(4..4 + size).ok_or_else(|| {
                StreamError::invalid_section(format!(
                    "module section of {} bytes exceeds event body ({} bytes left)",
                    size,
                    rest.len() - 4
                ))
            })?;

            modules.push(ModuleSectionRef {
                type_id: ((header & listfile::MODULE_TYPE_MASK) >> listfile::MODULE_TYPE_SHIFT) as u8,
                data,
            });
            rest = &rest[4 + size..];
        }

        Ok(modules)
    }
}

/// Iterates the sections of a filled output buffer
pub struct SectionIter<'a> {
    rest: &'a [u8],
}

impl<'a> SectionIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }
}

impl<'a> Iterator for SectionIter<'a> {
    type Item = Result<EventSectionRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < 4 {
            return None;
        }

        let r = self.rest;
        let header = u32::from_le_bytes([r[0], r[1], r[2], r[3]]);
        let size = (header & listfile::SECTION_SIZE_MASK) as usize * 4;

        let Some(body) = r.get(4..4 + size) else {
            self.rest = &[];
            return Some(Err(StreamError::invalid_section(format!(
                "section of {} bytes exceeds buffer ({} bytes left)",
                size,
                r.len() - 4
            ))));
        };

        self.rest = &r[4 + size..];

        Some(Ok(EventSectionRef {
            section_type: (header >> listfile::SECTION_TYPE_SHIFT) as u8,
            event_index: ((header & listfile::EVENT_INDEX_MASK) >> listfile::EVENT_INDEX_SHIFT) as u8,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_with_two_modules() {
        let mut buf = DataBuffer::new();
        let mut writer = StreamWriter::default();

        writer.open_event_section(&mut buf, 3);
        writer.open_module_section(&mut buf, 10);
        writer.write_module_words(&mut buf, &[0x1111, 0x2222]);
        writer.close_module_section(&mut buf);
        writer.open_module_section(&mut buf, 11);
        writer.write_module_data(&mut buf, 0x3333);
        writer.write_event_data(&mut buf, listfile::END_MARKER);
        let flags = writer.close_event_section(&mut buf);

        assert!(flags.is_empty());
        assert!(!writer.has_open_event_section());

        let words: Vec<u32> = buf.words().collect();
        assert_eq!(
            words,
            vec![
                0x2003_0006,
                0x0000_a002,
                0x1111,
                0x2222,
                0x0000_b001,
                0x3333,
                listfile::END_MARKER
            ]
        );

        let sections: Vec<_> = SectionIter::new(buf.as_bytes()).collect::<Result<_>>().unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].section_type as u32, listfile::SECTION_EVENT);
        assert_eq!(sections[0].event_index, 3);

        let modules = sections[0].modules().unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].type_id, 10);
        assert_eq!(modules[0].words().collect::<Vec<_>>(), vec![0x1111, 0x2222]);
        assert_eq!(modules[1].type_id, 11);
        assert_eq!(modules[1].len(), 1);
    }

    #[test]
    fn test_module_size_ceiling_truncates() {
        let mut buf = DataBuffer::new();
        let mut writer = StreamWriter::new(WriterLimits::new(4, 100));

        writer.open_event_section(&mut buf, 0);
        writer.open_module_section(&mut buf, 1);

        for i in 0..4 {
            assert!(writer.write_module_data(&mut buf, i).is_empty());
        }
        let flags = writer.write_module_data(&mut buf, 99);
        assert!(flags.module_size_exceeded());
        assert!(!flags.event_size_exceeded());

        // sticky until the module is closed
        assert!(writer.write_module_data(&mut buf, 100).module_size_exceeded());
        let closed = writer.close_event_section(&mut buf);
        assert!(closed.module_size_exceeded());

        let section = SectionIter::new(buf.as_bytes()).next().unwrap().unwrap();
        let modules = section.modules().unwrap();
        assert_eq!(modules[0].words().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(buf.len(), 4 * (1 + 1 + 4));
    }

    #[test]
    fn test_event_size_ceiling_drops_modules() {
        let mut buf = DataBuffer::new();
        let mut writer = StreamWriter::new(WriterLimits::new(100, 3));

        writer.open_event_section(&mut buf, 1);
        writer.open_module_section(&mut buf, 2);
        writer.write_module_words(&mut buf, &[1, 2]);
        assert!(writer.flags().is_empty());

        let flags = writer.write_module_data(&mut buf, 3);
        assert!(flags.event_size_exceeded());

        let flags = writer.open_module_section(&mut buf, 4);
        assert!(flags.event_size_exceeded());
        assert!(!flags.module_size_exceeded());
        writer.write_module_data(&mut buf, 5);
        writer.close_event_section(&mut buf);

        let words: Vec<u32> = buf.words().collect();
        assert_eq!(words, vec![0x2001_0003, 0x0000_2002, 1, 2]);
    }

    #[test]
    fn test_limits_clamped_to_header_fields() {
        let limits = WriterLimits::new(5000, 1_000_000);
        assert_eq!(limits.max_module_words, 0x3ff);
        assert_eq!(limits.max_event_words, 0xffff);
    }

    #[test]
    fn test_section_iter_reports_truncated_buffer() {
        let mut buf = DataBuffer::new();
        buf.push_u32(0x2000_0005);
        buf.push_u32(0);

        let mut iter = SectionIter::new(buf.as_bytes());
        assert!(matches!(iter.next(), Some(Err(StreamError::InvalidSection(_)))));
        assert!(iter.next().is_none());
    }
}
