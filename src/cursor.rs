//! Position-tracking little-endian reader shared by the catalog and zone
//! decoders.
//!
//! Every read takes a short `context` label.  A short read never surfaces as
//! a bare `UnexpectedEof`; it becomes [`FormatError::Truncated`] carrying the
//! label and the exact byte offset where the stream ran dry.
//!
//! Length fields read from a file are never trusted for allocation.  Bulk
//! reads grow their buffer with the bytes that actually arrive, and a cursor
//! built with [`ByteCursor::with_limit`] can refuse a declared length up
//! front when it exceeds what is left of the stream.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::catalog::{FormatError, MAX_STRING_LEN};

pub(crate) struct ByteCursor<R: Read> {
    inner: R,
    pos:   u64,
    /// Total stream length, when known.
    limit: Option<u64>,
}

impl<R: Read> ByteCursor<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, pos: 0, limit: None }
    }

    /// A cursor over a stream known to hold exactly `len` bytes.
    pub fn with_limit(inner: R, len: u64) -> Self {
        Self { inner, pos: 0, limit: Some(len) }
    }

    /// Absolute offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Bytes left before the known end of stream; `None` when unbounded.
    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|l| l.saturating_sub(self.pos))
    }

    /// Fill `buf` completely.  On a short read `pos` reflects the bytes that
    /// did arrive, so callers can report how much was available.
    pub fn read_exact(&mut self, buf: &mut [u8], context: &'static str) -> Result<(), FormatError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(FormatError::Truncated { context, offset: self.pos });
                }
                Ok(n) => {
                    filled   += n;
                    self.pos += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FormatError::Io(e)),
            }
        }
        Ok(())
    }

    /// Read `len` bytes into a fresh buffer.  The buffer grows with the data
    /// received, so a corrupt `len` costs at most what the stream holds.
    pub fn read_vec(&mut self, len: u64, context: &'static str) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::new();
        (&mut self.inner).take(len).read_to_end(&mut buf)?;
        self.pos += buf.len() as u64;
        if (buf.len() as u64) < len {
            return Err(FormatError::Truncated { context, offset: self.pos });
        }
        Ok(buf)
    }

    /// Read exactly four bytes, or report a clean end of stream as `None`.
    /// A partial word is still truncation.
    pub fn read_word_or_eof(&mut self, context: &'static str) -> Result<Option<[u8; 4]>, FormatError> {
        let mut word = [0u8; 4];
        let mut filled = 0;
        while filled < word.len() {
            match self.inner.read(&mut word[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(FormatError::Truncated { context, offset: self.pos }),
                Ok(n) => {
                    filled   += n;
                    self.pos += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FormatError::Io(e)),
            }
        }
        Ok(Some(word))
    }

    pub fn u8(&mut self, context: &'static str) -> Result<u8, FormatError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b, context)?;
        Ok(b[0])
    }

    pub fn u32(&mut self, context: &'static str) -> Result<u32, FormatError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b, context)?;
        Ok(LittleEndian::read_u32(&b))
    }

    pub fn i32(&mut self, context: &'static str) -> Result<i32, FormatError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b, context)?;
        Ok(LittleEndian::read_i32(&b))
    }

    pub fn u64(&mut self, context: &'static str) -> Result<u64, FormatError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b, context)?;
        Ok(LittleEndian::read_u64(&b))
    }

    pub fn f64(&mut self, context: &'static str) -> Result<f64, FormatError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b, context)?;
        Ok(LittleEndian::read_f64(&b))
    }

    /// `u32` byte length followed by that many bytes, decoded lossily as UTF-8.
    pub fn string(&mut self, context: &'static str) -> Result<String, FormatError> {
        let offset = self.pos;
        let len = self.u32(context)?;
        if len > MAX_STRING_LEN {
            return Err(FormatError::Implausible { what: context, value: len as u64, offset });
        }
        let mut bytes = vec![0u8; len as usize];
        self.read_exact(&mut bytes, context)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Discard up to `n` bytes; returns how many were actually skipped.
    pub fn skip(&mut self, n: u64) -> Result<u64, FormatError> {
        let skipped = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())?;
        self.pos += skipped;
        Ok(skipped)
    }
}

pub(crate) fn write_string<W: Write>(mut writer: W, s: &str) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(s.len() as u32)?;
    writer.write_all(s.as_bytes())
}
