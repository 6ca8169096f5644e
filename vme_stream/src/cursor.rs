/*!
Bounds-checked, alignment-aware read cursor over raw controller buffers.

Every controller buffer is little endian. The framed-stack protocol is read in
32-bit words, the legacy protocol in 16-bit words with 32-bit data values
assembled from two consecutive half-words.
*/

use crate::error::EndOfBuffer;

/// Natural word size of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Word16,
    Word32,
}

impl Alignment {
    /// Size of one word in bytes
    pub fn word_bytes(self) -> usize {
        match self {
            Self::Word16 => 2,
            Self::Word32 => 4,
        }
    }
}

/// Read cursor over a borrowed byte buffer.
///
/// `peek_*` never moves the cursor. `extract_*` and `skip*` move it only on
/// success, so a failed read leaves the position untouched.
#[derive(Debug, Clone)]
pub struct WordCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    alignment: Alignment,
}

impl<'a> WordCursor<'a> {
    pub fn new(buf: &'a [u8], alignment: Alignment) -> Self {
        Self {
            buf,
            pos: 0,
            alignment,
        }
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    /// Current byte offset from the start of the buffer
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes_left(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whole words left in the cursor's alignment unit
    pub fn words_left(&self) -> usize {
        self.bytes_left() / self.alignment.word_bytes()
    }

    pub fn u16_left(&self) -> usize {
        self.bytes_left() / 2
    }

    pub fn u32_left(&self) -> usize {
        self.bytes_left() / 4
    }

    /// True once no complete word remains. Trailing bytes shorter than a word
    /// are unreadable and count as end.
    pub fn at_end(&self) -> bool {
        self.words_left() == 0
    }

    /// Unread bytes
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn bytes_at(&self, offset: usize, len: usize) -> Result<&'a [u8], EndOfBuffer> {
        let start = self.pos.checked_add(offset);
        let end = start.and_then(|s| s.checked_add(len));

        match (start, end) {
            (Some(start), Some(end)) if end <= self.buf.len() => Ok(&self.buf[start..end]),
            _ => Err(EndOfBuffer {
                offset: self.pos.saturating_add(offset),
                wanted: len,
                available: self.bytes_left().saturating_sub(offset),
            }),
        }
    }

    /// Peek the word `offset` words ahead of the current position
    pub fn peek_word_at(&self, offset: usize) -> Result<u32, EndOfBuffer> {
        let width = self.alignment.word_bytes();
        let bytes = self.bytes_at(offset * width, width)?;
        Ok(match self.alignment {
            Alignment::Word16 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
            Alignment::Word32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        })
    }

    pub fn peek_word(&self) -> Result<u32, EndOfBuffer> {
        self.peek_word_at(0)
    }

    /// Read one word in the cursor's alignment unit and advance
    pub fn extract_word(&mut self) -> Result<u32, EndOfBuffer> {
        let word = self.peek_word()?;
        self.pos += self.alignment.word_bytes();
        Ok(word)
    }

    pub fn peek_u16(&self) -> Result<u16, EndOfBuffer> {
        let bytes = self.bytes_at(0, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn extract_u16(&mut self) -> Result<u16, EndOfBuffer> {
        let value = self.peek_u16()?;
        self.pos += 2;
        Ok(value)
    }

    /// Read a 32-bit value regardless of alignment. On 16-bit buffers the low
    /// half comes first.
    pub fn extract_u32(&mut self) -> Result<u32, EndOfBuffer> {
        let bytes = self.bytes_at(0, 4)?;
        let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.pos += 4;
        Ok(value)
    }

    /// Skip `words` words. Either all of them are skipped or none.
    pub fn skip(&mut self, words: usize) -> Result<(), EndOfBuffer> {
        let bytes = words.saturating_mul(self.alignment.word_bytes());
        self.skip_bytes(bytes)
    }

    pub fn skip_bytes(&mut self, bytes: usize) -> Result<(), EndOfBuffer> {
        self.bytes_at(0, bytes)?;
        self.pos += bytes;
        Ok(())
    }

    /// Split off the next `words` words as a separate cursor with the same
    /// alignment and advance past them.
    pub fn split_words(&mut self, words: usize) -> Result<WordCursor<'a>, EndOfBuffer> {
        let len = words.saturating_mul(self.alignment.word_bytes());
        let bytes = self.bytes_at(0, len)?;
        self.pos += len;
        Ok(WordCursor::new(bytes, self.alignment))
    }
}
