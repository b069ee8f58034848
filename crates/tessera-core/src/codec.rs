// SPDX-License-Identifier: Apache-2.0

//! Versioned binary encoding for value types shared across processes.
//!
//! Every top-level encoding starts with a one-byte format version followed by
//! the fields in declaration order. Optional trailing fields are written only
//! when present, so a reader must treat "end of buffer" as "absent".

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{EngineError, EngineResult};

/// Explicit encode/decode pair for a wire-visible value type.
pub trait WireFormat: Sized {
    /// Highest format version this build writes and understands.
    const VERSION: u8;

    /// Writes the fields (without the version byte).
    fn encode_body(&self, out: &mut BytesMut);

    /// Reads the fields written by `encode_body` for the given version.
    fn decode_body(version: u8, input: &mut WireReader) -> EngineResult<Self>;

    fn to_wire(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(Self::VERSION);
        self.encode_body(&mut out);
        out.freeze()
    }

    fn from_wire(bytes: Bytes) -> EngineResult<Self> {
        let mut input = WireReader::new(bytes);
        let version = input.u8()?;
        if version == 0 || version > Self::VERSION {
            return Err(EngineError::malformed(format!(
                "unsupported format version {version} (max {})",
                Self::VERSION
            )));
        }
        let value = Self::decode_body(version, &mut input)?;
        if input.has_remaining() {
            return Err(EngineError::malformed(format!(
                "{} trailing bytes after value",
                input.remaining()
            )));
        }
        Ok(value)
    }
}

pub fn put_str(out: &mut BytesMut, value: &str) {
    out.put_u32(value.len() as u32);
    out.put_slice(value.as_bytes());
}

pub fn put_bytes(out: &mut BytesMut, value: &[u8]) {
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

pub fn put_opt_str(out: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(v) => {
            out.put_u8(1);
            put_str(out, v);
        }
        None => out.put_u8(0),
    }
}

/// Bounds-checked reader over an encoded buffer.
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> EngineResult<()> {
        if self.buf.remaining() < n {
            return Err(EngineError::malformed(format!(
                "truncated input: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> EngineResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self) -> EngineResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(EngineError::malformed(format!("invalid bool byte {other}"))),
        }
    }

    pub fn u32(&mut self) -> EngineResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> EngineResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn i64(&mut self) -> EngineResult<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn f64(&mut self) -> EngineResult<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn bytes(&mut self) -> EngineResult<Bytes> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn string(&mut self) -> EngineResult<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| EngineError::malformed(format!("invalid utf-8 string: {e}")))
    }

    pub fn opt_string(&mut self) -> EngineResult<Option<String>> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_truncation_instead_of_panicking() {
        let mut out = BytesMut::new();
        out.put_u32(10);
        out.put_slice(b"abc");
        let mut reader = WireReader::new(out.freeze());
        let err = reader.string().unwrap_err();
        assert!(matches!(err, EngineError::MalformedEnvelope { .. }));
    }

    #[test]
    fn rejects_invalid_bool() {
        let mut reader = WireReader::new(Bytes::from_static(&[7]));
        assert!(reader.bool().is_err());
    }
}
