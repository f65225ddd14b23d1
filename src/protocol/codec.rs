//! Binary wire codec for the master-server protocols.
//!
//! Replaces the legacy ExoParseBuffer/ExoBuildBuffer pair. All integer
//! fields are unsigned little-endian; string fields are Latin-1 (one byte
//! per char, never UTF-8) carried with a u8 or u16 length prefix.
//!
//! Decoding fails softly: every reader returns `Option` and a short read or
//! out-of-range length yields `None`. The dispatcher discards the datagram
//! in that case. Encoding silently truncates overlong strings to the field
//! capacity — a wire-compat quirk the deployed client population depends
//! on, so it must not be tightened.

use bytes::{BufMut, BytesMut};

/// Cursor-based reader over a received payload.
pub struct ParseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ParseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left unread in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let b = self.read_bytes(2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let b = self.read_bytes(4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    /// Reads a string with a u8 length prefix. Fails if the declared length
    /// exceeds `cap`. NUL padding is trimmed from the right.
    pub fn read_small_string(&mut self, cap: usize) -> Option<String> {
        let len = self.read_u8()? as usize;
        self.read_string_body(len, cap)
    }

    /// Reads a string with a u16 length prefix.
    pub fn read_string16(&mut self, cap: usize) -> Option<String> {
        let len = self.read_u16()? as usize;
        self.read_string_body(len, cap)
    }

    fn read_string_body(&mut self, len: usize, cap: usize) -> Option<String> {
        if len > cap {
            return None;
        }
        let raw = self.read_bytes(len)?;
        let trimmed = match raw.iter().rposition(|&b| b != 0) {
            Some(i) => &raw[..=i],
            None => &raw[..0],
        };
        // Latin-1: each byte maps directly to the same code point.
        Some(trimmed.iter().map(|&b| b as char).collect())
    }
}

/// Builder for outbound datagrams.
#[derive(Default)]
pub struct BuildBuffer {
    buf: BytesMut,
}

impl BuildBuffer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(64) }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Writes a u8-length-prefixed string, truncating to `cap` bytes.
    pub fn write_small_string(&mut self, s: &str, cap: usize) {
        let bytes = latin1_bytes(s, cap.min(u8::MAX as usize));
        self.buf.put_u8(bytes.len() as u8);
        self.buf.put_slice(&bytes);
    }

    /// Writes a u16-length-prefixed string, truncating to `cap` bytes.
    pub fn write_string16(&mut self, s: &str, cap: usize) {
        let bytes = latin1_bytes(s, cap.min(u16::MAX as usize));
        self.buf.put_u16_le(bytes.len() as u16);
        self.buf.put_slice(&bytes);
    }

    /// Writes a fixed-width field, NUL-padded to `width` and truncated past
    /// it.
    pub fn write_fixed_string(&mut self, s: &str, width: usize) {
        let bytes = latin1_bytes(s, width);
        self.buf.put_slice(&bytes);
        self.buf.put_bytes(0, width - bytes.len());
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Lowers a string to Latin-1 bytes, truncated to `cap`. Code points above
/// 0xFF become '?' — the legacy encoder did the same.
fn latin1_bytes(s: &str, cap: usize) -> Vec<u8> {
    s.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .take(cap)
        .collect()
}

/// Splits a datagram into its 4-byte LE opcode and the remaining payload.
pub fn decode_envelope(data: &[u8]) -> Option<(u32, &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let cmd = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    Some((cmd, &data[4..]))
}

/// Starts a datagram with the given 4-byte opcode already written.
pub fn begin_message(cmd: u32) -> BuildBuffer {
    let mut b = BuildBuffer::new();
    b.write_u32(cmd);
    b
}
