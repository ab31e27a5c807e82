//! # Typed Values
//!
//! [`Value`] is the closed set of values the wire codec understands. Every value
//! knows its own [`Type`], so a message body's signature can always be derived
//! from its values.
//!
//! Arrays carry their element type explicitly so that empty arrays still have a
//! well-defined signature, and construction through [`Array::from_values`] keeps
//! every array homogeneous.

use crate::core::names::validate_object_path;
use crate::core::signature::{Signature, Type};
use crate::error::{BusError, Result};
use std::fmt;

/// A validated object path such as `/org/freedesktop/DBus`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: &str) -> Result<Self> {
        validate_object_path(path)?;
        Ok(Self(path.to_string()))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = BusError;

    fn try_from(path: &str) -> Result<Self> {
        Self::new(path)
    }
}

/// A homogeneous array with an explicit element type
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element: Type,
    items: Vec<Value>,
}

impl Array {
    /// An empty array of the given element type
    pub fn new(element: Type) -> Self {
        Self {
            element,
            items: Vec::new(),
        }
    }

    /// Build an array, checking that every item has the element type
    pub fn from_values(element: Type, items: Vec<Value>) -> Result<Self> {
        let mut array = Self::new(element);
        array.items.reserve(items.len());
        for item in items {
            array.push(item)?;
        }
        Ok(array)
    }

    pub fn push(&mut self, item: Value) -> Result<()> {
        let item_type = item.value_type();
        if item_type != self.element {
            return Err(BusError::Codec(format!(
                "array of '{}' cannot hold a value of type '{}'",
                self.element, item_type
            )));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn element_type(&self) -> &Type {
        &self.element
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }
}

/// A single typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    Array(Array),
    Struct(Vec<Value>),
    Variant(Box<Value>),
    DictEntry(Box<Value>, Box<Value>),
}

impl Value {
    /// The complete type describing this value
    pub fn value_type(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Bool(_) => Type::Bool,
            Value::Int16(_) => Type::Int16,
            Value::UInt16(_) => Type::UInt16,
            Value::Int32(_) => Type::Int32,
            Value::UInt32(_) => Type::UInt32,
            Value::Int64(_) => Type::Int64,
            Value::UInt64(_) => Type::UInt64,
            Value::Double(_) => Type::Double,
            Value::Str(_) => Type::Str,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::Array(array) => Type::Array(Box::new(array.element.clone())),
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::value_type).collect()),
            Value::Variant(_) => Type::Variant,
            Value::DictEntry(key, value) => {
                Type::DictEntry(Box::new(key.value_type()), Box::new(value.value_type()))
            }
        }
    }

    /// Wrap a value in a variant
    pub fn variant(value: impl Into<Value>) -> Self {
        Value::Variant(Box::new(value.into()))
    }

    /// Build a homogeneous array value
    pub fn array(element: Type, items: Vec<Value>) -> Result<Self> {
        Ok(Value::Array(Array::from_values(element, items)?))
    }

    /// Build a dictionary (`a{kv}`) value
    pub fn dict(key: Type, value: Type, entries: Vec<(Value, Value)>) -> Result<Self> {
        if !key.is_basic() {
            return Err(BusError::Codec(format!(
                "dict key type '{key}' is not a basic type"
            )));
        }
        let element = Type::DictEntry(Box::new(key), Box::new(value));
        let items = entries
            .into_iter()
            .map(|(k, v)| Value::DictEntry(Box::new(k), Box::new(v)))
            .collect();
        Self::array(element, items)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(g) => Some(g.as_str()),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Unwrap one level of variant, if any
    pub fn inner(&self) -> &Value {
        match self {
            Value::Variant(inner) => inner,
            other => other,
        }
    }
}

/// Derive the signature describing a sequence of values
pub fn signature_of(values: &[Value]) -> Result<Signature> {
    let types: Vec<Type> = values.iter().map(Value::value_type).collect();
    Signature::from_types(&types)
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Str,
    ObjectPath => ObjectPath,
    Signature => Signature,
    Array => Array,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
