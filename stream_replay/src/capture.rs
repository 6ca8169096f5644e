/*!
Raw buffer capture files.

A capture file is a flat sequence of records, one per controller buffer, each
made of a little-endian `u32` buffer number, a little-endian `u32` byte length
and the buffer bytes. Captures are produced by the `synth` command or by a
recording frontend and consumed by the replay pipeline.
*/

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

/// Largest buffer accepted when reading a capture
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

const RECORD_HEADER_BYTES: usize = 8;

/// Appends buffer records to a capture file
pub struct CaptureWriter<W: Write> {
    inner: W,
}

impl CaptureWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create capture file: {}", path.as_ref().display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_buffer(&mut self, buffer_number: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).with_context(|| format!("buffer {} too large", buffer_number))?;

        self.inner.write_all(&buffer_number.to_le_bytes())?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(data)?;
        Ok(())
    }

    /// Flush and return the underlying writer
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush().context("Failed to flush capture file")?;
        Ok(self.inner)
    }
}

/// Reads buffer records back from a capture file
pub struct CaptureReader<R: Read> {
    inner: R,
    records: u64,
    done: bool,
}

impl CaptureReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open capture file: {}", path.as_ref().display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> CaptureReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            records: 0,
            done: false,
        }
    }

    fn read_record(&mut self) -> Result<Option<(u32, Bytes)>> {
        let mut header = [0u8; RECORD_HEADER_BYTES];

        // A clean end of file is only allowed between records.
        let mut filled = 0;
        while filled < header.len() {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => bail!("capture truncated in header of record {}", self.records),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let buffer_number = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        if len > MAX_RECORD_BYTES {
            bail!(
                "record {} (buffer {}) claims {} bytes, limit is {}",
                self.records,
                buffer_number,
                len,
                MAX_RECORD_BYTES
            );
        }

        let mut data = vec![0u8; len];
        self.inner
            .read_exact(&mut data)
            .with_context(|| format!("capture truncated in data of record {}", self.records))?;

        self.records += 1;
        Ok(Some((buffer_number, Bytes::from(data))))
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<(u32, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    #[test]
    fn test_capture_file_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();

        let mut writer = CaptureWriter::create(temp_file.path()).unwrap();
        writer.write_buffer(0, &[1, 2, 3, 4]).unwrap();
        writer.write_buffer(1, &[]).unwrap();
        writer.write_buffer(7, &[0xaa; 10]).unwrap();
        writer.finish().unwrap();

        // Three record headers plus 14 payload bytes
        assert_eq!(std::fs::metadata(temp_file.path()).unwrap().len(), 3 * 8 + 14);

        let records: Vec<_> = CaptureReader::open(temp_file.path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0], (0, Bytes::from_static(&[1, 2, 3, 4])));
        assert!(records[1].1.is_empty());
        assert_eq!(records[2].0, 7);
        assert_eq!(records[2].1.len(), 10);
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let mut writer = CaptureWriter::new(Vec::new());
        writer.write_buffer(3, &[0u8; 16]).unwrap();
        let mut raw = writer.finish().unwrap();
        raw.truncate(raw.len() - 4);

        let mut reader = CaptureReader::new(Cursor::new(raw));
        let err = reader.next().unwrap().unwrap_err();
        assert!(format!("{:#}", err).contains("truncated in data"));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&5u32.to_le_bytes());
        raw.extend_from_slice(&u32::MAX.to_le_bytes());

        let mut reader = CaptureReader::new(Cursor::new(raw));
        assert!(reader.next().unwrap().is_err());
    }

    #[test]
    fn test_partial_header_is_an_error() {
        let mut reader = CaptureReader::new(Cursor::new(vec![1u8, 0, 0]));
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("truncated in header"));
    }
}
