//! PackStream value codec.
//!
//! PackStream is the compact binary encoding Bolt carries values in. Every
//! value starts with a marker byte; small integers, short strings, and small
//! collections encode their payload or length directly in the marker, larger
//! ones follow with an 8-, 16-, or 32-bit big-endian length. Encoding always
//! picks the smallest form that fits; decoding accepts any form.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::structs::StructCatalog;
use crate::value::{Struct, Value, ValueMap};

/// Marker bytes for every PackStream value family.
pub mod marker {
    /// Smallest integer encodable inline in the marker byte.
    pub const TINY_INT_MIN: i64 = -16;
    /// Largest integer encodable inline in the marker byte.
    pub const TINY_INT_MAX: i64 = 127;

    /// Base marker for strings of up to 15 bytes.
    pub const TINY_STRING: u8 = 0x80;
    /// Base marker for lists of up to 15 items.
    pub const TINY_LIST: u8 = 0x90;
    /// Base marker for maps of up to 15 entries.
    pub const TINY_MAP: u8 = 0xA0;
    /// Base marker for structs of up to 15 fields.
    pub const TINY_STRUCT: u8 = 0xB0;

    pub const NULL: u8 = 0xC0;
    pub const FLOAT_64: u8 = 0xC1;
    pub const FALSE: u8 = 0xC2;
    pub const TRUE: u8 = 0xC3;

    pub const INT_8: u8 = 0xC8;
    pub const INT_16: u8 = 0xC9;
    pub const INT_32: u8 = 0xCA;
    pub const INT_64: u8 = 0xCB;

    pub const STRING_8: u8 = 0xD0;
    pub const STRING_16: u8 = 0xD1;
    pub const STRING_32: u8 = 0xD2;

    pub const LIST_8: u8 = 0xD4;
    pub const LIST_16: u8 = 0xD5;
    pub const LIST_32: u8 = 0xD6;

    pub const MAP_8: u8 = 0xD8;
    pub const MAP_16: u8 = 0xD9;
    pub const MAP_32: u8 = 0xDA;
}

/// Maximum nesting depth the decoder accepts. Deeper input is rejected
/// instead of risking stack exhaustion on hostile payloads.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Serializes values into PackStream bytes.
#[derive(Debug, Default)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    /// Create an empty packer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Serialize one value, recursively.
    pub fn pack(&mut self, value: &Value) -> Result<(), EncodeError> {
        match value {
            Value::Null => {
                self.pack_null();
                Ok(())
            }
            Value::Bool(b) => {
                self.pack_bool(*b);
                Ok(())
            }
            Value::Int(i) => {
                self.pack_int(*i);
                Ok(())
            }
            Value::Float(f) => {
                self.pack_float(*f);
                Ok(())
            }
            Value::String(s) => self.pack_string(s),
            Value::List(items) => {
                self.pack_list_header(items.len())?;
                for item in items {
                    self.pack(item)?;
                }
                Ok(())
            }
            Value::Map(map) => {
                self.pack_map_header(map.len())?;
                for (key, item) in map.iter() {
                    self.pack_string(key)?;
                    self.pack(item)?;
                }
                Ok(())
            }
            Value::Struct(s) => {
                self.pack_struct_header(s.signature, s.fields.len())?;
                for field in &s.fields {
                    self.pack(field)?;
                }
                Ok(())
            }
        }
    }

    /// Write a null marker.
    pub fn pack_null(&mut self) {
        self.buf.put_u8(marker::NULL);
    }

    /// Write a boolean marker.
    pub fn pack_bool(&mut self, value: bool) {
        self.buf
            .put_u8(if value { marker::TRUE } else { marker::FALSE });
    }

    /// Write an integer in the smallest form that holds it.
    pub fn pack_int(&mut self, value: i64) {
        if (marker::TINY_INT_MIN..=marker::TINY_INT_MAX).contains(&value) {
            self.buf.put_u8(value as u8);
        } else if i64::from(i8::MIN) <= value && value < marker::TINY_INT_MIN {
            self.buf.put_u8(marker::INT_8);
            self.buf.put_i8(value as i8);
        } else if i64::from(i16::MIN) <= value && value <= i64::from(i16::MAX) {
            self.buf.put_u8(marker::INT_16);
            self.buf.put_i16(value as i16);
        } else if i64::from(i32::MIN) <= value && value <= i64::from(i32::MAX) {
            self.buf.put_u8(marker::INT_32);
            self.buf.put_i32(value as i32);
        } else {
            self.buf.put_u8(marker::INT_64);
            self.buf.put_i64(value);
        }
    }

    /// Write a 64-bit float.
    pub fn pack_float(&mut self, value: f64) {
        self.buf.put_u8(marker::FLOAT_64);
        self.buf.put_f64(value);
    }

    /// Write a UTF-8 string with the smallest length header.
    pub fn pack_string(&mut self, value: &str) -> Result<(), EncodeError> {
        self.pack_length(value.len(), marker::TINY_STRING, marker::STRING_8)?;
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    /// Write a list header; the caller packs each item afterwards.
    pub fn pack_list_header(&mut self, len: usize) -> Result<(), EncodeError> {
        self.pack_length(len, marker::TINY_LIST, marker::LIST_8)
    }

    /// Write a map header; the caller packs each key/value afterwards.
    pub fn pack_map_header(&mut self, len: usize) -> Result<(), EncodeError> {
        self.pack_length(len, marker::TINY_MAP, marker::MAP_8)
    }

    /// Write a struct header and signature; the caller packs each field.
    pub fn pack_struct_header(&mut self, signature: u8, fields: usize) -> Result<(), EncodeError> {
        if fields > 0x0F {
            return Err(EncodeError::StructTooLarge(fields));
        }
        self.buf.put_u8(marker::TINY_STRUCT | fields as u8);
        self.buf.put_u8(signature);
        Ok(())
    }

    // The three sized marker families are laid out identically, so one
    // helper writes tiny/8/16/32-bit headers given the family base bytes.
    fn pack_length(&mut self, len: usize, tiny_base: u8, sized_base: u8) -> Result<(), EncodeError> {
        if len <= 0x0F {
            self.buf.put_u8(tiny_base | len as u8);
        } else if len <= u8::MAX as usize {
            self.buf.put_u8(sized_base);
            self.buf.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.put_u8(sized_base + 1);
            self.buf.put_u16(len as u16);
        } else if len <= u32::MAX as usize {
            self.buf.put_u8(sized_base + 2);
            self.buf.put_u32(len as u32);
        } else {
            return Err(EncodeError::ValueTooLarge(len));
        }
        Ok(())
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the packer and return the encoded bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Deserializes PackStream bytes into values.
///
/// The unpacker validates nested structures against a [`StructCatalog`]:
/// signatures outside the catalog are rejected, as are known signatures
/// with the wrong field count.
pub struct Unpacker<'a> {
    data: &'a [u8],
    pos: usize,
    catalog: &'a StructCatalog,
}

impl<'a> Unpacker<'a> {
    /// Create an unpacker that rejects all nested structures.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_catalog(data, StructCatalog::empty())
    }

    /// Create an unpacker with a version's structure catalog.
    pub fn with_catalog(data: &'a [u8], catalog: &'a StructCatalog) -> Self {
        Self {
            data,
            pos: 0,
            catalog,
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if all input has been consumed.
    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Decode the next value.
    pub fn unpack(&mut self) -> Result<Value, DecodeError> {
        self.unpack_at_depth(0)
    }

    /// Read the marker and signature of a top-level message struct.
    ///
    /// Returns the signature byte and field count. Fields are decoded by
    /// the caller with [`Unpacker::unpack`].
    pub fn read_struct_header(&mut self) -> Result<(u8, usize), DecodeError> {
        let m = self.read_u8()?;
        if m & 0xF0 != marker::TINY_STRUCT {
            return Err(DecodeError::ExpectedStruct(m));
        }
        let signature = self.read_u8()?;
        Ok((signature, (m & 0x0F) as usize))
    }

    fn unpack_at_depth(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(DecodeError::NestingTooDeep);
        }
        let m = self.read_u8()?;
        match m {
            0x00..=0x7F => Ok(Value::Int(m as i64)),
            0xF0..=0xFF => Ok(Value::Int(m as i8 as i64)),

            0x80..=0x8F => self.read_string((m & 0x0F) as usize),
            0x90..=0x9F => self.read_list((m & 0x0F) as usize, depth),
            0xA0..=0xAF => self.read_map((m & 0x0F) as usize, depth),
            0xB0..=0xBF => self.read_value_struct((m & 0x0F) as usize, depth),

            marker::NULL => Ok(Value::Null),
            marker::TRUE => Ok(Value::Bool(true)),
            marker::FALSE => Ok(Value::Bool(false)),
            marker::FLOAT_64 => Ok(Value::Float(f64::from_bits(self.read_u64()?))),

            marker::INT_8 => Ok(Value::Int(self.read_u8()? as i8 as i64)),
            marker::INT_16 => Ok(Value::Int(self.read_u16()? as i16 as i64)),
            marker::INT_32 => Ok(Value::Int(self.read_u32()? as i32 as i64)),
            marker::INT_64 => Ok(Value::Int(self.read_u64()? as i64)),

            marker::STRING_8 => {
                let len = self.read_u8()? as usize;
                self.read_string(len)
            }
            marker::STRING_16 => {
                let len = self.read_u16()? as usize;
                self.read_string(len)
            }
            marker::STRING_32 => {
                let len = self.read_u32()? as usize;
                self.read_string(len)
            }

            marker::LIST_8 => {
                let len = self.read_u8()? as usize;
                self.read_list(len, depth)
            }
            marker::LIST_16 => {
                let len = self.read_u16()? as usize;
                self.read_list(len, depth)
            }
            marker::LIST_32 => {
                let len = self.read_u32()? as usize;
                self.read_list(len, depth)
            }

            marker::MAP_8 => {
                let len = self.read_u8()? as usize;
                self.read_map(len, depth)
            }
            marker::MAP_16 => {
                let len = self.read_u16()? as usize;
                self.read_map(len, depth)
            }
            marker::MAP_32 => {
                let len = self.read_u32()? as usize;
                self.read_map(len, depth)
            }

            other => Err(DecodeError::UnknownMarker(other)),
        }
    }

    fn read_string(&mut self, len: usize) -> Result<Value, DecodeError> {
        let bytes = self.read_bytes(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(Value::String(s.to_string()))
    }

    fn read_list(&mut self, len: usize, depth: usize) -> Result<Value, DecodeError> {
        // Cap the preallocation; a hostile header can claim any length.
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.unpack_at_depth(depth + 1)?);
        }
        Ok(Value::List(items))
    }

    fn read_map(&mut self, len: usize, depth: usize) -> Result<Value, DecodeError> {
        let mut map = ValueMap::with_capacity(len.min(1024));
        for _ in 0..len {
            let key = match self.unpack_at_depth(depth + 1)? {
                Value::String(s) => s,
                _ => return Err(DecodeError::InvalidMapKey),
            };
            let value = self.unpack_at_depth(depth + 1)?;
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }

    fn read_value_struct(&mut self, fields: usize, depth: usize) -> Result<Value, DecodeError> {
        let signature = self.read_u8()?;
        let def = self
            .catalog
            .lookup(signature)
            .ok_or(DecodeError::UnsupportedStruct(signature))?;
        if def.arity != fields {
            return Err(DecodeError::InvalidStructArity {
                signature,
                expected: def.arity,
                actual: fields,
            });
        }
        let mut items = Vec::with_capacity(fields);
        for _ in 0..fields {
            items.push(self.unpack_at_depth(depth + 1)?);
        }
        Ok(Value::Struct(Struct::new(signature, items)))
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.remaining() < 1 {
            return Err(DecodeError::UnexpectedEndOfInput);
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEndOfInput);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

/// Serialize a single value to bytes.
pub fn pack(value: &Value) -> Result<Bytes, EncodeError> {
    let mut packer = Packer::new();
    packer.pack(value)?;
    Ok(packer.into_bytes())
}

/// Deserialize exactly one value from a buffer.
///
/// Trailing bytes after the value are an error.
pub fn unpack(data: &[u8]) -> Result<Value, DecodeError> {
    unpack_with_catalog(data, StructCatalog::empty())
}

/// Deserialize exactly one value, allowing the catalog's structures.
pub fn unpack_with_catalog(data: &[u8], catalog: &StructCatalog) -> Result<Value, DecodeError> {
    let mut unpacker = Unpacker::with_catalog(data, catalog);
    let value = unpacker.unpack()?;
    if !unpacker.is_done() {
        return Err(DecodeError::TrailingBytes(unpacker.remaining()));
    }
    Ok(value)
}
