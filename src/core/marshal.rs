//! # Wire Marshalling
//!
//! Encodes and decodes [`Value`]s against a [`Signature`] in the D-Bus binary format.
//!
//! ## Layout Rules
//! - Byte order is fixed per encoder/decoder and marked `l` (little) or `B` (big)
//! - Every value is padded to its natural alignment, measured from the start of the
//!   buffer (which for a message body is itself 8-aligned)
//! - Strings and object paths: `u32` length, UTF-8 bytes, NUL (not counted)
//! - Signatures: `u8` length, ASCII bytes, NUL
//! - Arrays: `u32` byte length, padding to the element alignment, elements
//! - Variants: inline signature of exactly one type, then the value
//!
//! Decoding never trusts a count: arrays are bounded by their declared byte length
//! and every read is checked against the end of the input.

use crate::core::signature::{Signature, Type};
use crate::core::value::{Array, ObjectPath, Value};
use crate::error::{constants, BusError, Result};
use serde::{Deserialize, Serialize};

/// Maximum array payload length (64 MiB)
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

/// Maximum combined container nesting while walking values
pub const MAX_DEPTH: usize = 64;

/// Byte order of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Wire marker byte
    pub fn marker(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'l' => Some(Endian::Little),
            b'B' => Some(Endian::Big),
            _ => None,
        }
    }
}

/// Number of padding bytes needed to bring `offset` to `align`
#[inline]
pub fn padding_for(offset: usize, align: usize) -> usize {
    (align - offset % align) % align
}

/// Encode a sequence of values described by `signature`
pub fn encode(values: &[Value], signature: &Signature, endian: Endian) -> Result<Vec<u8>> {
    let types = signature.types();
    if types.len() != values.len() {
        return Err(BusError::Codec(format!(
            "signature '{}' describes {} values, got {}",
            signature,
            types.len(),
            values.len()
        )));
    }

    let mut encoder = Encoder::new(endian);
    for (value, ty) in values.iter().zip(types) {
        encoder.encode(value, ty)?;
    }
    Ok(encoder.into_bytes())
}

/// Encode a single value of type `ty`
pub fn encode_value(value: &Value, ty: &Type, endian: Endian) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(endian);
    encoder.encode(value, ty)?;
    Ok(encoder.into_bytes())
}

/// Decode the values described by `signature`, starting at `offset`.
///
/// Returns the values and the offset just past the last one.
pub fn decode(
    bytes: &[u8],
    signature: &Signature,
    offset: usize,
    endian: Endian,
) -> Result<(Vec<Value>, usize)> {
    let mut decoder = Decoder::new(bytes, offset, endian);
    let values = signature
        .types()
        .iter()
        .map(|ty| decoder.decode(ty))
        .collect::<Result<Vec<_>>>()?;
    Ok((values, decoder.position()))
}

/// Decode a single value of type `ty` starting at `offset`
pub fn decode_value(bytes: &[u8], ty: &Type, offset: usize, endian: Endian) -> Result<(Value, usize)> {
    let mut decoder = Decoder::new(bytes, offset, endian);
    let value = decoder.decode(ty)?;
    Ok((value, decoder.position()))
}

/// Appends aligned values to a growing buffer
#[derive(Debug)]
pub struct Encoder {
    buf: Vec<u8>,
    endian: Endian,
    depth: usize,
}

impl Encoder {
    pub fn new(endian: Endian) -> Self {
        Self {
            buf: Vec::new(),
            endian,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn pad_to(&mut self, align: usize) {
        let pad = padding_for(self.buf.len(), align);
        self.buf.resize(self.buf.len() + pad, 0);
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.pad_to(2);
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.pad_to(4);
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.pad_to(8);
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        let bytes = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    fn put_string(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(BusError::codec(constants::ERR_INTERIOR_NUL));
        }
        let len = u32::try_from(s.len())
            .map_err(|_| BusError::Codec(format!("string of {} bytes is too long", s.len())))?;
        self.put_u32(len);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn put_signature(&mut self, sig: &Signature) {
        // Signature validation caps the length at 255
        self.buf.push(sig.as_str().len() as u8);
        self.buf.extend_from_slice(sig.as_str().as_bytes());
        self.buf.push(0);
    }

    /// Encode `value`, which must have type `ty`
    pub fn encode(&mut self, value: &Value, ty: &Type) -> Result<()> {
        match (ty, value) {
            (Type::Byte, Value::Byte(v)) => self.put_u8(*v),
            (Type::Bool, Value::Bool(v)) => self.put_u32(u32::from(*v)),
            (Type::Int16, Value::Int16(v)) => self.put_u16(*v as u16),
            (Type::UInt16, Value::UInt16(v)) => self.put_u16(*v),
            (Type::Int32, Value::Int32(v)) => self.put_u32(*v as u32),
            (Type::UInt32, Value::UInt32(v)) => self.put_u32(*v),
            (Type::Int64, Value::Int64(v)) => self.put_u64(*v as u64),
            (Type::UInt64, Value::UInt64(v)) => self.put_u64(*v),
            (Type::Double, Value::Double(v)) => self.put_u64(v.to_bits()),
            (Type::Str, Value::Str(s)) => self.put_string(s)?,
            (Type::ObjectPath, Value::ObjectPath(p)) => self.put_string(p.as_str())?,
            (Type::Signature, Value::Signature(sig)) => self.put_signature(sig),
            (Type::Variant, Value::Variant(inner)) => {
                let inner_type = inner.value_type();
                let sig = Signature::from_types(std::slice::from_ref(&inner_type))?;
                self.put_signature(&sig);
                self.nested(|enc| enc.encode(inner, &inner_type))?;
            }
            (Type::Array(elem), Value::Array(array)) => {
                if array.element_type() != elem.as_ref() {
                    return Err(mismatch(ty, value));
                }
                self.put_u32(0);
                let len_at = self.buf.len() - 4;
                self.pad_to(elem.alignment());
                let start = self.buf.len();
                self.nested(|enc| {
                    for item in array.items() {
                        enc.encode(item, elem)?;
                    }
                    Ok(())
                })?;
                let len = self.buf.len() - start;
                if len > MAX_ARRAY_LEN {
                    return Err(BusError::codec(constants::ERR_ARRAY_TOO_LONG));
                }
                self.patch_u32(len_at, len as u32);
            }
            (Type::Struct(fields), Value::Struct(values)) => {
                if fields.len() != values.len() {
                    return Err(mismatch(ty, value));
                }
                self.pad_to(8);
                self.nested(|enc| {
                    for (field, value) in fields.iter().zip(values) {
                        enc.encode(value, field)?;
                    }
                    Ok(())
                })?;
            }
            (Type::DictEntry(key_type, value_type), Value::DictEntry(key, value)) => {
                self.pad_to(8);
                self.nested(|enc| {
                    enc.encode(key, key_type)?;
                    enc.encode(value, value_type)
                })?;
            }
            _ => return Err(mismatch(ty, value)),
        }
        Ok(())
    }

    fn nested<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(BusError::codec(constants::ERR_NESTING_TOO_DEEP));
        }
        let result = f(self);
        self.depth -= 1;
        result
    }
}

fn mismatch(ty: &Type, value: &Value) -> BusError {
    BusError::Codec(format!(
        "expected a value of type '{}', got '{}'",
        ty,
        value.value_type()
    ))
}

/// Reads aligned values from a byte slice
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
    depth: usize,
}

impl<'a> Decoder<'a> {
    /// Start decoding at `offset`. Alignment is measured from the start of `buf`.
    pub fn new(buf: &'a [u8], offset: usize, endian: Endian) -> Self {
        Self {
            buf,
            pos: offset,
            endian,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Skip padding up to `align`, requiring the padding to be zero
    pub fn align(&mut self, align: usize) -> Result<()> {
        let pad = padding_for(self.pos, align);
        let padding = self.take(pad)?;
        if padding.iter().any(|b| *b != 0) {
            return Err(BusError::codec(constants::ERR_NONZERO_PADDING));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| BusError::codec(constants::ERR_TRUNCATED))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        })
    }

    fn read_str(&mut self, len: usize) -> Result<&'a str> {
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err(BusError::codec(constants::ERR_MISSING_NUL));
        }
        if bytes.contains(&0) {
            return Err(BusError::codec(constants::ERR_INTERIOR_NUL));
        }
        std::str::from_utf8(bytes).map_err(|_| BusError::codec(constants::ERR_INVALID_UTF8))
    }

    fn read_string(&mut self) -> Result<&'a str> {
        let len = self.read_u32()? as usize;
        self.read_str(len)
    }

    fn read_signature(&mut self) -> Result<Signature> {
        let len = self.read_u8()? as usize;
        Signature::new(self.read_str(len)?)
    }

    /// Decode one value of type `ty`
    pub fn decode(&mut self, ty: &Type) -> Result<Value> {
        let value = match ty {
            Type::Byte => Value::Byte(self.read_u8()?),
            Type::Bool => match self.read_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(BusError::codec(constants::ERR_INVALID_BOOLEAN)),
            },
            Type::Int16 => Value::Int16(self.read_u16()? as i16),
            Type::UInt16 => Value::UInt16(self.read_u16()?),
            Type::Int32 => Value::Int32(self.read_u32()? as i32),
            Type::UInt32 => Value::UInt32(self.read_u32()?),
            Type::Int64 => Value::Int64(self.read_u64()? as i64),
            Type::UInt64 => Value::UInt64(self.read_u64()?),
            Type::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            Type::Str => Value::Str(self.read_string()?.to_string()),
            Type::ObjectPath => Value::ObjectPath(ObjectPath::new(self.read_string()?)?),
            Type::Signature => Value::Signature(self.read_signature()?),
            Type::Variant => {
                let sig = self.read_signature()?;
                let inner_type = sig
                    .single()
                    .ok_or_else(|| BusError::codec(constants::ERR_VARIANT_SIGNATURE))?
                    .clone();
                let inner = self.nested(|dec| dec.decode(&inner_type))?;
                Value::Variant(Box::new(inner))
            }
            Type::Array(elem) => Value::Array(self.decode_array(elem)?),
            Type::Struct(fields) => {
                self.align(8)?;
                let values = self.nested(|dec| {
                    fields.iter().map(|field| dec.decode(field)).collect::<Result<Vec<_>>>()
                })?;
                Value::Struct(values)
            }
            Type::DictEntry(key_type, value_type) => {
                self.align(8)?;
                let (key, value) = self.nested(|dec| {
                    let key = dec.decode(key_type)?;
                    let value = dec.decode(value_type)?;
                    Ok((key, value))
                })?;
                Value::DictEntry(Box::new(key), Box::new(value))
            }
        };
        Ok(value)
    }

    fn decode_array(&mut self, elem: &Type) -> Result<Array> {
        let len = self.read_u32()? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(BusError::codec(constants::ERR_ARRAY_TOO_LONG));
        }
        self.align(elem.alignment())?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| BusError::codec(constants::ERR_TRUNCATED))?;

        let items = self.nested(|dec| {
            let mut items = Vec::new();
            while dec.pos < end {
                items.push(dec.decode(elem)?);
            }
            if dec.pos != end {
                return Err(BusError::codec(constants::ERR_ARRAY_LENGTH));
            }
            Ok(items)
        })?;

        Array::from_values(elem.clone(), items)
    }

    fn nested<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(BusError::codec(constants::ERR_NESTING_TOO_DEEP));
        }
        let result = f(self);
        self.depth -= 1;
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sig(s: &str) -> Signature {
        Signature::new(s).unwrap()
    }

    #[test]
    fn test_string_layout() {
        let bytes = encode(&["abc".into()], &sig("s"), Endian::Little).unwrap();
        assert_eq!(bytes, vec![3, 0, 0, 0, b'a', b'b', b'c', 0]);

        let big = encode(&["abc".into()], &sig("s"), Endian::Big).unwrap();
        assert_eq!(big, vec![0, 0, 0, 3, b'a', b'b', b'c', 0]);
    }

    #[test]
    fn test_padding_between_values() {
        let values = vec![Value::Byte(1), Value::UInt64(2)];
        let bytes = encode(&values, &sig("yt"), Endian::Little).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[1..8], &[0; 7]);
        assert_eq!(bytes[8], 2);
    }

    #[test]
    fn test_empty_array_keeps_element_padding() {
        let empty = Value::array(Type::UInt64, vec![]).unwrap();
        let bytes = encode(&[empty.clone()], &sig("at"), Endian::Little).unwrap();
        // length word followed by padding to 8
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 0]);

        let (decoded, end) = decode(&bytes, &sig("at"), 0, Endian::Little).unwrap();
        assert_eq!(decoded, vec![empty]);
        assert_eq!(end, 8);
    }

    #[test]
    fn test_array_length_excludes_leading_padding() {
        let arr = Value::array(Type::UInt64, vec![Value::UInt64(7)]).unwrap();
        let bytes = encode(&[arr], &sig("at"), Endian::Little).unwrap();
        assert_eq!(&bytes[0..4], &8u32.to_le_bytes());
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_variant_layout() {
        let bytes = encode(&[Value::variant(5u32)], &sig("v"), Endian::Little).unwrap();
        assert_eq!(bytes, vec![1, b'u', 0, 0, 5, 0, 0, 0]);
    }

    #[test]
    fn test_decode_from_offset() {
        let mut bytes = vec![0xAA];
        bytes.extend_from_slice(&[0, 0, 0]);
        bytes.extend_from_slice(&42u32.to_le_bytes());
        let (values, end) = decode(&bytes, &sig("u"), 1, Endian::Little).unwrap();
        assert_eq!(values, vec![Value::UInt32(42)]);
        assert_eq!(end, 8);
    }

    #[test]
    fn test_signature_value_mismatch() {
        assert!(encode(&[Value::UInt32(1)], &sig("s"), Endian::Little).is_err());
        assert!(encode(&[Value::UInt32(1)], &sig("uu"), Endian::Little).is_err());
        let strings = Value::array(Type::Str, vec![]).unwrap();
        assert!(encode(&[strings], &sig("ai"), Endian::Little).is_err());
    }

    #[test]
    fn test_rejects_truncated_input() {
        let bytes = encode(&["hello".into()], &sig("s"), Endian::Little).unwrap();
        for cut in 0..bytes.len() {
            assert!(decode(&bytes[..cut], &sig("s"), 0, Endian::Little).is_err());
        }
    }

    #[test]
    fn test_rejects_bad_strings() {
        let mut bytes = vec![2, 0, 0, 0, 0xFF, 0xFE, 0];
        assert!(decode(&bytes, &sig("s"), 0, Endian::Little).is_err());

        bytes = vec![2, 0, 0, 0, b'a', b'b', b'c'];
        assert!(decode(&bytes, &sig("s"), 0, Endian::Little).is_err());

        assert!(encode(&["a\0b".into()], &sig("s"), Endian::Little).is_err());
    }

    #[test]
    fn test_rejects_invalid_boolean() {
        let bytes = 2u32.to_le_bytes();
        assert!(decode(&bytes, &sig("b"), 0, Endian::Little).is_err());
    }

    #[test]
    fn test_rejects_array_length_disagreement() {
        // declares 6 bytes of u32 elements: the second element overruns
        let mut bytes = 6u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        assert!(decode(&bytes, &sig("au"), 0, Endian::Little).is_err());
    }

    #[test]
    fn test_rejects_nonzero_padding() {
        let bytes = vec![1, 0xFF, 0, 0, 9, 0, 0, 0];
        assert!(decode(&bytes, &sig("yu"), 0, Endian::Little).is_err());
    }

    #[test]
    fn test_rejects_multi_type_variant() {
        let bytes = vec![2, b'u', b'u', 0, 1, 0, 0, 0, 2, 0, 0, 0];
        assert!(decode(&bytes, &sig("v"), 0, Endian::Little).is_err());
    }
}
