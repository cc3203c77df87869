//! Intel OMF object-module reader.
//!
//! Low-level record framing and typed field readers. Every record is
//! `[type:u8][length:u16 le][payload][checksum:u8]`; the checksum is read
//! but not verified. Record types come in 16/32-bit pairs distinguished by
//! the low opcode bit: odd opcodes widen length/displacement fields to 32
//! bits.

pub mod library;
pub mod record;

use crate::error::LoadError;

// Record type constants (Intel OMF specification + Microsoft extensions).
pub const THEADR: u8 = 0x80;
pub const LHEADR: u8 = 0x82;
pub const COMENT: u8 = 0x88;
pub const MODEND: u8 = 0x8A;
pub const MODEND32: u8 = 0x8B;
pub const EXTDEF: u8 = 0x8C;
pub const PUBDEF: u8 = 0x90;
pub const PUBDEF32: u8 = 0x91;
pub const LNAMES: u8 = 0x96;
pub const SEGDEF: u8 = 0x98;
pub const SEGDEF32: u8 = 0x99;
pub const GRPDEF: u8 = 0x9A;
pub const FIXUPP: u8 = 0x9C;
pub const FIXUPP32: u8 = 0x9D;
pub const LEDATA: u8 = 0xA0;
pub const LEDATA32: u8 = 0xA1;
pub const LIDATA: u8 = 0xA2;
pub const LIDATA32: u8 = 0xA3;
pub const COMDEF: u8 = 0xB0;
pub const LEXTDEF: u8 = 0xB4;
pub const LPUBDEF: u8 = 0xB6;
pub const LPUBDEF32: u8 = 0xB7;
pub const ALIAS: u8 = 0xC6;
pub const LIBHDR: u8 = 0xF0;
pub const LIBEND: u8 = 0xF1;

/// One framed record: type tag, payload (checksum stripped), file position.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    pub kind: u8,
    pub contents: &'a [u8],
    pub checksum: u8,
    /// File offset of the record's type byte.
    pub pos: usize,
    /// Total encoded size including framing.
    pub total_len: usize,
}

impl<'a> RawRecord<'a> {
    /// Read the record starting at `pos`.
    pub fn read(bytes: &'a [u8], pos: usize) -> Result<Self, LoadError> {
        if pos + 3 > bytes.len() {
            return Err(LoadError::RecordTruncated(pos));
        }
        let kind = bytes[pos];
        let len = u16::from_le_bytes([bytes[pos + 1], bytes[pos + 2]]) as usize;
        if len == 0 || pos + 3 + len > bytes.len() {
            return Err(LoadError::RecordTruncated(pos));
        }
        Ok(Self {
            kind,
            contents: &bytes[pos + 3..pos + 3 + len - 1],
            checksum: bytes[pos + 3 + len - 1],
            pos,
            total_len: 3 + len,
        })
    }

    pub fn next_pos(&self) -> usize {
        self.pos + self.total_len
    }
}

/// Cursor over one record's payload with the OMF field encodings.
pub struct RecordReader<'a> {
    kind: u8,
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(rec: &RawRecord<'a>) -> Self {
        Self { kind: rec.kind, data: rec.contents, pos: 0 }
    }

    /// Odd opcodes are the 32-bit record family.
    pub fn is_32bit(&self) -> bool {
        self.kind & 1 == 1
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn truncated(&self) -> LoadError {
        LoadError::malformed(self.kind, format!("field truncated at payload byte {}", self.pos))
    }

    pub fn byte(&mut self) -> Result<u8, LoadError> {
        let b = *self.data.get(self.pos).ok_or_else(|| self.truncated())?;
        self.pos += 1;
        Ok(b)
    }

    pub fn word(&mut self) -> Result<u16, LoadError> {
        if self.pos + 2 > self.data.len() {
            return Err(self.truncated());
        }
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub fn dword(&mut self) -> Result<u32, LoadError> {
        if self.pos + 4 > self.data.len() {
            return Err(self.truncated());
        }
        let v = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    /// Name/segment/group/external index: 1 byte if the high bit is clear,
    /// else 2 bytes holding the top 7 bits first.
    pub fn index(&mut self) -> Result<usize, LoadError> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            Ok(first as usize)
        } else {
            let second = self.byte()?;
            Ok(((first as usize & 0x7F) << 8) | second as usize)
        }
    }

    /// Length or displacement: 16-bit in the even record family, 32-bit in
    /// the odd one.
    pub fn length(&mut self) -> Result<u32, LoadError> {
        if self.is_32bit() {
            self.dword()
        } else {
            Ok(self.word()? as u32)
        }
    }

    /// Length-prefixed string.
    pub fn counted_string(&mut self) -> Result<String, LoadError> {
        let n = self.byte()? as usize;
        if self.pos + n > self.data.len() {
            return Err(self.truncated());
        }
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + n]).into_owned();
        self.pos += n;
        Ok(s)
    }

    /// COMDEF communal length: 1 byte up to 0x80, or a marker byte selecting
    /// a 2-, 3-, or 4-byte little-endian value.
    pub fn communal_length(&mut self) -> Result<u32, LoadError> {
        let first = self.byte()?;
        match first {
            0..=0x80 => Ok(first as u32),
            0x81 => Ok(self.word()? as u32),
            0x84 => {
                let lo = self.word()? as u32;
                let hi = self.byte()? as u32;
                Ok((hi << 16) | lo)
            }
            0x88 => self.dword(),
            other => {
                Err(LoadError::malformed(self.kind, format!("bad communal length marker {other:#04X}")))
            }
        }
    }

    /// Remaining payload bytes, consuming them.
    pub fn rest(&mut self) -> &'a [u8] {
        let r = &self.data[self.pos..];
        self.pos = self.data.len();
        r
    }
}
