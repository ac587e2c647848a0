//! Little-endian binary reader and writer
//!
//! The module format and save states are hand-specified byte layouts, so
//! serialization goes through these two small cursor types rather than a
//! generic framework. The reader is fully bounds-checked: malformed input
//! produces a [`ReadError`], never a panic.

use std::fmt;

use crate::flyweight::FlyweightString;

/// Error while reading a binary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The stream ended before the requested bytes.
    UnexpectedEnd,
    /// Structurally valid bytes with an invalid meaning (bad tag, bad ID).
    InvalidData(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::UnexpectedEnd => write!(f, "unexpected end of data"),
            ReadError::InvalidData(msg) => write!(f, "invalid data: {}", msg),
        }
    }
}

impl std::error::Error for ReadError {}

/// Growing little-endian byte sink.
#[derive(Default)]
pub struct BinaryWriter {
    data: Vec<u8>,
}

macro_rules! write_primitive {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, value: $ty) {
            self.data.extend_from_slice(&value.to_le_bytes());
        }
    };
}

impl BinaryWriter {
    pub fn new() -> Self {
        BinaryWriter { data: Vec::new() }
    }

    write_primitive!(write_u8, u8);
    write_primitive!(write_u16, u16);
    write_primitive!(write_u32, u32);
    write_primitive!(write_u64, u64);
    write_primitive!(write_i8, i8);
    write_primitive!(write_i16, i16);
    write_primitive!(write_i32, i32);
    write_primitive!(write_i64, i64);

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Length-prefixed (u32) UTF-8 string.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }

    /// A flyweight string is stored as its text; the hash is recomputed on
    /// read.
    pub fn write_flyweight(&mut self, s: &FlyweightString) {
        self.write_str(s.as_str());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Bounds-checked little-endian cursor over a byte slice.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

macro_rules! read_primitive {
    ($name:ident, $ty:ty, $size:expr) => {
        pub fn $name(&mut self) -> Result<$ty, ReadError> {
            let bytes = self.read_bytes($size)?;
            Ok(<$ty>::from_le_bytes(bytes.try_into().expect("sized read")))
        }
    };
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    read_primitive!(read_u8, u8, 1);
    read_primitive!(read_u16, u16, 2);
    read_primitive!(read_u32, u32, 4);
    read_primitive!(read_u64, u64, 8);
    read_primitive!(read_i8, i8, 1);
    read_primitive!(read_i16, i16, 2);
    read_primitive!(read_i32, i32, 4);
    read_primitive!(read_i64, i64, 8);

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], ReadError> {
        if self.pos + count > self.data.len() {
            return Err(ReadError::UnexpectedEnd);
        }
        let bytes = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    pub fn read_str(&mut self) -> Result<String, ReadError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ReadError::InvalidData("string is not valid UTF-8".into()))
    }

    pub fn read_flyweight(&mut self) -> Result<FlyweightString, ReadError> {
        Ok(FlyweightString::new(&self.read_str()?))
    }

    /// Look at the next four bytes without consuming them.
    pub fn peek_u32(&self) -> Result<u32, ReadError> {
        if self.pos + 4 > self.data.len() {
            return Err(ReadError::UnexpectedEnd);
        }
        let bytes: [u8; 4] = self.data[self.pos..self.pos + 4]
            .try_into()
            .expect("sized peek");
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn skip(&mut self, count: usize) -> Result<(), ReadError> {
        if self.pos + count > self.data.len() {
            return Err(ReadError::UnexpectedEnd);
        }
        self.pos += count;
        Ok(())
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.pos
    }
}
