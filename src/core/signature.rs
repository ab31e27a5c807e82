//! # Type Signatures
//!
//! Parsing and validation of D-Bus type signatures.
//!
//! A signature is a compact string describing zero or more complete types, for
//! example `a{sv}` (a dictionary of string to variant) or `(iis)`. Parsing produces
//! a closed [`Type`] tree that the marshaller matches exhaustively.
//!
//! ## Limits
//! - At most 255 bytes of signature text
//! - At most 32 nested arrays and 32 nested structs (dict entries count as structs)
//! - Dict entries only appear as array elements and have a basic-type key
//! - Structs have at least one field

use crate::error::{BusError, Result};
use std::fmt;
use std::str::FromStr;

/// Maximum signature length in bytes
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Maximum array nesting in one signature
pub const MAX_ARRAY_DEPTH: usize = 32;

/// Maximum struct nesting in one signature
pub const MAX_STRUCT_DEPTH: usize = 32;

/// A single complete type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Byte,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Str,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Natural alignment of the type on the wire
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::UInt16 => 2,
            Type::Bool
            | Type::Int32
            | Type::UInt32
            | Type::Str
            | Type::ObjectPath
            | Type::Array(_) => 4,
            Type::Int64 | Type::UInt64 | Type::Double | Type::Struct(_) | Type::DictEntry(..) => 8,
        }
    }

    /// Basic types are the only ones allowed as dict keys
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Struct(_) | Type::DictEntry(..)
        )
    }

    fn write_code(&self, out: &mut String) {
        match self {
            Type::Byte => out.push('y'),
            Type::Bool => out.push('b'),
            Type::Int16 => out.push('n'),
            Type::UInt16 => out.push('q'),
            Type::Int32 => out.push('i'),
            Type::UInt32 => out.push('u'),
            Type::Int64 => out.push('x'),
            Type::UInt64 => out.push('t'),
            Type::Double => out.push('d'),
            Type::Str => out.push('s'),
            Type::ObjectPath => out.push('o'),
            Type::Signature => out.push('g'),
            Type::Variant => out.push('v'),
            Type::Array(elem) => {
                out.push('a');
                elem.write_code(out);
            }
            Type::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_code(out);
                }
                out.push(')');
            }
            Type::DictEntry(key, value) => {
                out.push('{');
                key.write_code(out);
                value.write_code(out);
                out.push('}');
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut code = String::new();
        self.write_code(&mut code);
        f.write_str(&code)
    }
}

/// A validated signature: zero or more complete types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    text: String,
    types: Vec<Type>,
}

impl Signature {
    /// Parse and validate signature text
    pub fn new(text: &str) -> Result<Self> {
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(invalid(text, "longer than 255 bytes"));
        }

        let mut parser = Parser {
            text,
            bytes: text.as_bytes(),
            pos: 0,
            array_depth: 0,
            struct_depth: 0,
        };

        let mut types = Vec::new();
        while parser.pos < parser.bytes.len() {
            types.push(parser.parse_type()?);
        }

        Ok(Self {
            text: text.to_string(),
            types,
        })
    }

    /// The empty signature (no body)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a signature from a sequence of types, re-validating every limit
    pub fn from_types(types: &[Type]) -> Result<Self> {
        let mut text = String::new();
        for ty in types {
            ty.write_code(&mut text);
        }
        Self::new(&text)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The type, if this signature holds exactly one complete type
    pub fn single(&self) -> Option<&Type> {
        match self.types.as_slice() {
            [ty] => Some(ty),
            _ => None,
        }
    }
}

impl FromStr for Signature {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn invalid(text: &str, reason: &str) -> BusError {
    BusError::Codec(format!("invalid signature '{text}': {reason}"))
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl Parser<'_> {
    fn next(&mut self) -> Result<u8> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| invalid(self.text, "unexpected end"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse_type(&mut self) -> Result<Type> {
        let ty = match self.next()? {
            b'y' => Type::Byte,
            b'b' => Type::Bool,
            b'n' => Type::Int16,
            b'q' => Type::UInt16,
            b'i' => Type::Int32,
            b'u' => Type::UInt32,
            b'x' => Type::Int64,
            b't' => Type::UInt64,
            b'd' => Type::Double,
            b's' => Type::Str,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'v' => Type::Variant,
            b'a' => self.parse_array()?,
            b'(' => self.parse_struct()?,
            b'{' => return Err(invalid(self.text, "dict entry outside an array")),
            b')' | b'}' => return Err(invalid(self.text, "unbalanced closing bracket")),
            b'h' => return Err(invalid(self.text, "unix fd passing is not supported")),
            other => {
                return Err(invalid(
                    self.text,
                    &format!("unknown type code '{}'", other as char),
                ))
            }
        };
        Ok(ty)
    }

    fn parse_array(&mut self) -> Result<Type> {
        self.array_depth += 1;
        if self.array_depth > MAX_ARRAY_DEPTH {
            return Err(invalid(self.text, "arrays nested too deeply"));
        }

        let elem = if self.peek() == Some(b'{') {
            self.pos += 1;
            self.parse_dict_entry()?
        } else {
            self.parse_type()?
        };

        self.array_depth -= 1;
        Ok(Type::Array(Box::new(elem)))
    }

    fn parse_dict_entry(&mut self) -> Result<Type> {
        self.enter_struct()?;

        let key = self.parse_type()?;
        if !key.is_basic() {
            return Err(invalid(self.text, "dict key must be a basic type"));
        }
        let value = self.parse_type()?;
        if self.next()? != b'}' {
            return Err(invalid(self.text, "dict entry must hold exactly two types"));
        }

        self.struct_depth -= 1;
        Ok(Type::DictEntry(Box::new(key), Box::new(value)))
    }

    fn parse_struct(&mut self) -> Result<Type> {
        self.enter_struct()?;

        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => fields.push(self.parse_type()?),
                None => return Err(invalid(self.text, "unterminated struct")),
            }
        }
        if fields.is_empty() {
            return Err(invalid(self.text, "empty struct"));
        }

        self.struct_depth -= 1;
        Ok(Type::Struct(fields))
    }

    fn enter_struct(&mut self) -> Result<()> {
        self.struct_depth += 1;
        if self.struct_depth > MAX_STRUCT_DEPTH {
            return Err(invalid(self.text, "structs nested too deeply"));
        }
        Ok(())
    }
}
