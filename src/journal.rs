//! Block-framed, checksummed record log.
//!
//! Used for the write-ahead journal and, with the same framing, the
//! manifest. The file is a sequence of 32 KiB physical blocks; a record is
//! split into one or more fragments that never straddle a block boundary:
//!
//! ```text
//! +-----------+---------+---------+-- - - --+
//! | crc32c:u32| len:u16 | type:u8 | payload |
//! +-----------+---------+---------+-- - - --+
//! type: Full | First | Middle | Last
//! ```
//!
//! The checksum covers the type byte and the payload, so a fragment that was
//! torn by a crash or flipped on disk fails validation as a unit. A reader
//! in non-strict mode drops the damaged fragment, reports the lost bytes to
//! its sink, and resynchronizes at the next block boundary; fragments of a
//! record whose start was lost are dropped the same way.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::storage::WritableFile;

/// Size of a physical block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Fragment header: crc (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const TYPE_FULL: u8 = 1;
const TYPE_FIRST: u8 = 2;
const TYPE_MIDDLE: u8 = 3;
const TYPE_LAST: u8 = 4;

/// Receives notice of bytes the reader had to discard.
pub trait DropSink: Send {
    fn dropped(&mut self, bytes: u64, reason: &str);
}

/// Default sink: log and move on.
pub struct TracingSink;

impl DropSink for TracingSink {
    fn dropped(&mut self, bytes: u64, reason: &str) {
        tracing::warn!(bytes, reason, "journal fragments dropped");
    }
}

/// Appends records to a journal file.
pub struct Writer<W: Write> {
    dest: W,
    block_offset: usize,
}

impl<W: Write> Writer<W> {
    pub fn new(dest: W) -> Self {
        Self {
            dest,
            block_offset: 0,
        }
    }

    /// Frames `record` into fragments and writes them through to the file.
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too small for a header: pad out the block.
                if leftover > 0 {
                    self.dest.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(avail);
            let end = fragment_len == left.len();
            let rtype = match (begin, end) {
                (true, true) => TYPE_FULL,
                (true, false) => TYPE_FIRST,
                (false, false) => TYPE_MIDDLE,
                (false, true) => TYPE_LAST,
            };
            self.emit(rtype, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if end {
                break;
            }
        }
        self.dest.flush()?;
        Ok(())
    }

    fn emit(&mut self, rtype: u8, payload: &[u8]) -> Result<()> {
        let mut digest = CRC32.digest();
        digest.update(&[rtype]);
        digest.update(payload);

        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[..4], digest.finalize());
        LittleEndian::write_u16(&mut header[4..6], payload.len() as u16);
        header[6] = rtype;

        self.dest.write_all(&header)?;
        self.dest.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }
}

impl<W: WritableFile> Writer<W> {
    /// Makes every appended record durable.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }
}

enum Physical {
    Record(u8, Vec<u8>),
    Eof,
    Bad(u64, &'static str),
}

/// Streams records out of a journal file.
pub struct Reader<R: Read> {
    src: R,
    sink: Box<dyn DropSink>,
    strict: bool,
    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> Reader<R> {
    pub fn new(src: R, sink: Box<dyn DropSink>, strict: bool) -> Self {
        Self {
            src,
            sink,
            strict,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Rewinds the reader onto a new file, keeping mode and sink.
    pub fn reset(&mut self, src: R) {
        self.src = src;
        self.buffer.clear();
        self.pos = 0;
        self.eof = false;
    }

    /// Next complete record, or `None` at end of file.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch: Option<Vec<u8>> = None;
        loop {
            match self.read_physical()? {
                Physical::Eof => {
                    if let Some(partial) = scratch {
                        // A crash mid-append leaves a headless tail; losing
                        // it is the expected truncation point.
                        self.sink
                            .dropped(partial.len() as u64, "record unfinished at end of file");
                    }
                    return Ok(None);
                }
                Physical::Bad(bytes, reason) => {
                    if self.strict {
                        return Err(Error::Corruption(reason.to_string()));
                    }
                    let partial = scratch.take().map_or(0, |s| s.len() as u64);
                    self.sink.dropped(bytes + partial, reason);
                }
                Physical::Record(TYPE_FULL, data) => {
                    if let Some(partial) = scratch {
                        self.report_or_fail(partial.len() as u64, "record start without end")?;
                    }
                    return Ok(Some(data));
                }
                Physical::Record(TYPE_FIRST, data) => {
                    if let Some(partial) = scratch {
                        self.report_or_fail(partial.len() as u64, "record start without end")?;
                    }
                    scratch = Some(data);
                }
                Physical::Record(TYPE_MIDDLE, data) => match scratch.as_mut() {
                    Some(acc) => acc.extend_from_slice(&data),
                    None => {
                        self.report_or_fail(data.len() as u64, "record fragment without start")?
                    }
                },
                Physical::Record(TYPE_LAST, data) => match scratch.take() {
                    Some(mut acc) => {
                        acc.extend_from_slice(&data);
                        return Ok(Some(acc));
                    }
                    None => {
                        self.report_or_fail(data.len() as u64, "record fragment without start")?
                    }
                },
                Physical::Record(t, data) => {
                    self.report_or_fail(
                        (HEADER_SIZE + data.len()) as u64,
                        if t == 0 {
                            "zeroed fragment header"
                        } else {
                            "unknown fragment type"
                        },
                    )?;
                    scratch = None;
                }
            }
        }
    }

    fn report_or_fail(&mut self, bytes: u64, reason: &'static str) -> Result<()> {
        if self.strict {
            return Err(Error::Corruption(reason.to_string()));
        }
        self.sink.dropped(bytes, reason);
        Ok(())
    }

    fn read_physical(&mut self) -> Result<Physical> {
        loop {
            if self.buffer.len() - self.pos < HEADER_SIZE {
                // Trailer (or first call): move to the next block.
                if self.eof {
                    return Ok(Physical::Eof);
                }
                self.fill_block()?;
                if self.buffer.is_empty() {
                    return Ok(Physical::Eof);
                }
                continue;
            }

            let header = &self.buffer[self.pos..self.pos + HEADER_SIZE];
            let expected_crc = LittleEndian::read_u32(&header[..4]);
            let len = LittleEndian::read_u16(&header[4..6]) as usize;
            let rtype = header[6];

            if rtype == 0 && len == 0 && expected_crc == 0 {
                // Zero padding, e.g. a preallocated region: skip the block.
                self.pos = self.buffer.len();
                continue;
            }

            let remaining = self.buffer.len() - self.pos;
            if HEADER_SIZE + len > remaining {
                self.pos = self.buffer.len();
                return Ok(Physical::Bad(
                    remaining as u64,
                    "fragment length overruns block",
                ));
            }

            let payload = &self.buffer[self.pos + HEADER_SIZE..self.pos + HEADER_SIZE + len];
            let mut digest = CRC32.digest();
            digest.update(&[rtype]);
            digest.update(payload);
            if digest.finalize() != expected_crc {
                // Resynchronize at the next block boundary; successor
                // fragments in this block are unusable without this one.
                let dropped = remaining as u64;
                self.pos = self.buffer.len();
                return Ok(Physical::Bad(dropped, "fragment checksum mismatch"));
            }

            let record = payload.to_vec();
            self.pos += HEADER_SIZE + len;
            return Ok(Physical::Record(rtype, record));
        }
    }

    fn fill_block(&mut self) -> Result<()> {
        self.buffer.clear();
        self.buffer.resize(BLOCK_SIZE, 0);
        self.pos = 0;
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.src.read(&mut self.buffer[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.buffer.truncate(filled);
        Ok(())
    }
}
