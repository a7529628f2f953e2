// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Byte stream primitives shared by the vpak format and the world
//! serializer: a common [`StreamError`], plus extension traits over
//! [`std::io::Read`] and [`std::io::Write`] for LEB128 varints, big-endian
//! fixed-width integers and length-prefixed strings.

use std::io;

/// Errors produced by the stream layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The operation is not supported by this stream.
    NotImplemented,
    /// The stream ended in the middle of a value.
    Truncated,
    /// Any other underlying I/O failure.
    Unknown,
}

impl core::fmt::Display for StreamError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StreamError::NotImplemented => f.write_str("operation not implemented"),
            StreamError::Truncated => f.write_str("stream ended unexpectedly"),
            StreamError::Unknown => f.write_str("unknown stream error"),
        }
    }
}

impl core::error::Error for StreamError {}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => StreamError::Truncated,
            io::ErrorKind::Unsupported => StreamError::NotImplemented,
            _ => StreamError::Unknown,
        }
    }
}

impl From<leb128::read::Error> for StreamError {
    fn from(err: leb128::read::Error) -> Self {
        match err {
            leb128::read::Error::IoError(err) => err.into(),
            leb128::read::Error::Overflow => StreamError::Truncated,
        }
    }
}

/// Reading primitives for the vane wire formats.
pub trait ReadExt: io::Read {
    fn read_byte(&mut self) -> Result<u8, StreamError> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn read_u32_be(&mut self) -> Result<u32, StreamError> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes)?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn read_u64_be(&mut self) -> Result<u64, StreamError> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes)?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Reads a LEB128 varint that must fit in 32 bits.
    fn read_varint_u32(&mut self) -> Result<u32, StreamError> {
        let value = self.read_varint_u64()?;
        u32::try_from(value).map_err(|_| StreamError::Truncated)
    }

    /// Reads a LEB128 varint.
    fn read_varint_u64(&mut self) -> Result<u64, StreamError> {
        let mut this = self;
        Ok(leb128::read::unsigned(&mut this)?)
    }

    /// Reads a varint length followed by that many bytes of UTF-8.
    fn read_string(&mut self) -> Result<String, StreamError> {
        let length = self.read_varint_u64()?;
        let length = usize::try_from(length).map_err(|_| StreamError::Truncated)?;
        let mut bytes = vec![0u8; length];
        self.read_exact(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| StreamError::Unknown)
    }
}

impl<R: io::Read + ?Sized> ReadExt for R {}

/// Writing primitives for the vane wire formats.
pub trait WriteExt: io::Write {
    fn write_byte(&mut self, byte: u8) -> Result<(), StreamError> {
        self.write_all(&[byte])?;
        Ok(())
    }

    fn write_u32_be(&mut self, value: u32) -> Result<(), StreamError> {
        self.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn write_u64_be(&mut self, value: u64) -> Result<(), StreamError> {
        self.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn write_varint_u32(&mut self, value: u32) -> Result<(), StreamError> {
        self.write_varint_u64(u64::from(value))
    }

    fn write_varint_u64(&mut self, value: u64) -> Result<(), StreamError> {
        let mut this = self;
        leb128::write::unsigned(&mut this, value)?;
        Ok(())
    }

    /// Writes a varint length followed by the string bytes.
    fn write_string(&mut self, value: &str) -> Result<(), StreamError> {
        self.write_varint_u64(value.len() as u64)?;
        self.write_all(value.as_bytes())?;
        Ok(())
    }
}

impl<W: io::Write + ?Sized> WriteExt for W {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        let mut buf = Vec::new();
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            buf.clear();
            buf.write_varint_u64(value).unwrap();
            let mut cursor = buf.as_slice();
            assert_eq!(cursor.read_varint_u64().unwrap(), value);
        }
    }

    #[test]
    fn varint_single_byte_values_stay_single_byte() {
        let mut buf = Vec::new();
        buf.write_varint_u32(127).unwrap();
        assert_eq!(buf, [0x7f]);

        buf.clear();
        buf.write_varint_u32(128).unwrap();
        assert_eq!(buf, [0x80, 0x01]);
    }

    #[test]
    fn truncated_varint_reports_truncation() {
        let mut cursor: &[u8] = &[0x80];
        assert_eq!(cursor.read_varint_u64(), Err(StreamError::Truncated));
    }

    #[test]
    fn oversized_varint_does_not_fit_u32() {
        let mut buf = Vec::new();
        buf.write_varint_u64(u64::from(u32::MAX) + 1).unwrap();
        let mut cursor = buf.as_slice();
        assert_eq!(cursor.read_varint_u32(), Err(StreamError::Truncated));
    }

    #[test]
    fn big_endian_round_trip() {
        let mut buf = Vec::new();
        buf.write_u32_be(0xdead_beef).unwrap();
        buf.write_u64_be(0x0123_4567_89ab_cdef).unwrap();
        let mut cursor = buf.as_slice();
        assert_eq!(cursor.read_u32_be().unwrap(), 0xdead_beef);
        assert_eq!(cursor.read_u64_be().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(cursor.read_byte(), Err(StreamError::Truncated));
    }

    #[test]
    fn string_round_trip() {
        let mut buf = Vec::new();
        buf.write_string("textures/stone_albedo").unwrap();
        let mut cursor = buf.as_slice();
        assert_eq!(cursor.read_string().unwrap(), "textures/stone_albedo");
    }
}
