//! # Messages
//!
//! A [`Message`] is a header plus a body of typed values.
//!
//! ## Wire Format
//! ```text
//! [endian(1)] [type(1)] [flags(1)] [version(1)] [body_len(4)] [serial(4)]
//! [header fields: a(yv)] [pad to 8] [body]
//! ```
//!
//! The first 16 bytes (the fixed part plus the header-field array length) are
//! enough to compute the length of the whole frame, see [`Message::frame_length`].

use crate::core::marshal::{self, padding_for, Decoder, Encoder, Endian};
use crate::core::names;
use crate::core::signature::{Signature, Type};
use crate::core::value::{signature_of, Array, ObjectPath, Value};
use crate::error::{constants, BusError, Result};
use bitflags::bitflags;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of the fixed header including the header-field array length
pub const FIXED_HEADER_LEN: usize = 16;

/// Maximum message size permitted by the protocol (128 MiB)
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Kind of message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = BusError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(BusError::UnknownMessageType(other)),
        }
    }
}

bitflags! {
    /// Header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

/// Header field codes
mod field {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
}

fn header_field_type() -> Type {
    Type::Struct(vec![Type::Byte, Type::Variant])
}

fn header_fields_type() -> Type {
    Type::Array(Box::new(header_field_type()))
}

/// A complete bus message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub endian: Endian,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    /// Zero until the connection assigns a serial at send time
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Signature,
    pub body: Vec<Value>,
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            endian: Endian::default(),
            message_type,
            flags: MessageFlags::empty(),
            serial: 0,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Vec::new(),
        }
    }

    /// New method call to `member` on the object at `path`
    pub fn method_call(path: &str, member: &str) -> Result<Self> {
        names::validate_member_name(member)?;
        let mut msg = Self::empty(MessageType::MethodCall);
        msg.path = Some(ObjectPath::new(path)?);
        msg.member = Some(member.to_string());
        Ok(msg)
    }

    /// New signal emitted from `path`
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self> {
        names::validate_interface_name(interface)?;
        names::validate_member_name(member)?;
        let mut msg = Self::empty(MessageType::Signal);
        msg.path = Some(ObjectPath::new(path)?);
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        Ok(msg)
    }

    /// New method return answering `call`
    pub fn method_return(call: &Message) -> Self {
        let mut msg = Self::empty(MessageType::MethodReturn);
        msg.endian = call.endian;
        msg.reply_serial = Some(call.serial);
        msg.destination = call.sender.clone();
        msg
    }

    /// New error reply answering `call`, carrying `text` as its single string argument
    pub fn error(call: &Message, error_name: &str, text: &str) -> Result<Self> {
        names::validate_error_name(error_name)?;
        let mut msg = Self::empty(MessageType::Error);
        msg.endian = call.endian;
        msg.reply_serial = Some(call.serial);
        msg.destination = call.sender.clone();
        msg.error_name = Some(error_name.to_string());
        msg.with_body(vec![Value::from(text)])
    }

    pub fn with_interface(mut self, interface: &str) -> Result<Self> {
        names::validate_interface_name(interface)?;
        self.interface = Some(interface.to_string());
        Ok(self)
    }

    pub fn with_destination(mut self, destination: &str) -> Result<Self> {
        names::validate_bus_name(destination)?;
        self.destination = Some(destination.to_string());
        Ok(self)
    }

    /// Replace the body, deriving the signature from the values
    pub fn with_body(mut self, body: Vec<Value>) -> Result<Self> {
        self.signature = signature_of(&body)?;
        self.body = body;
        Ok(self)
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::MethodReturn | MessageType::Error
        )
    }

    /// Whether the sender waits for a reply to this message
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// First string argument of the body, the human-readable text of an error reply
    pub fn error_text(&self) -> String {
        self.body
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Check that the header fields required by the message type are present
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            BusError::Framing(format!(
                "{}: {:?} without {field}",
                constants::ERR_MISSING_HEADER_FIELD,
                self.message_type
            ))
        };
        match self.message_type {
            MessageType::MethodCall => {
                self.path.as_ref().ok_or_else(|| missing("PATH"))?;
                self.member.as_ref().ok_or_else(|| missing("MEMBER"))?;
            }
            MessageType::Signal => {
                self.path.as_ref().ok_or_else(|| missing("PATH"))?;
                self.interface.as_ref().ok_or_else(|| missing("INTERFACE"))?;
                self.member.as_ref().ok_or_else(|| missing("MEMBER"))?;
            }
            MessageType::Error => {
                self.error_name.as_ref().ok_or_else(|| missing("ERROR_NAME"))?;
                self.reply_serial.ok_or_else(|| missing("REPLY_SERIAL"))?;
            }
            MessageType::MethodReturn => {
                self.reply_serial.ok_or_else(|| missing("REPLY_SERIAL"))?;
            }
        }
        Ok(())
    }

    fn header_fields(&self) -> Vec<Value> {
        let mut fields = Vec::with_capacity(8);
        let mut push = |code: u8, value: Value| {
            fields.push(Value::Struct(vec![Value::Byte(code), Value::variant(value)]));
        };

        if let Some(path) = &self.path {
            push(field::PATH, Value::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            push(field::INTERFACE, Value::from(interface.as_str()));
        }
        if let Some(member) = &self.member {
            push(field::MEMBER, Value::from(member.as_str()));
        }
        if let Some(error_name) = &self.error_name {
            push(field::ERROR_NAME, Value::from(error_name.as_str()));
        }
        if let Some(reply_serial) = self.reply_serial {
            push(field::REPLY_SERIAL, Value::UInt32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            push(field::DESTINATION, Value::from(destination.as_str()));
        }
        if let Some(sender) = &self.sender {
            push(field::SENDER, Value::from(sender.as_str()));
        }
        if !self.signature.is_empty() {
            push(field::SIGNATURE, Value::Signature(self.signature.clone()));
        }
        fields
    }

    /// Serialize the message into a complete frame
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.serial == 0 {
            return Err(BusError::framing(constants::ERR_ZERO_SERIAL));
        }
        self.validate()?;

        let body = marshal::encode(&self.body, &self.signature, self.endian)?;
        let body_len = u32::try_from(body.len()).map_err(|_| BusError::OversizedMessage {
            size: body.len(),
            limit: MAX_MESSAGE_SIZE,
        })?;

        let fields_type = header_fields_type();
        let fields = Value::Array(Array::from_values(header_field_type(), self.header_fields())?);

        let mut enc = Encoder::new(self.endian);
        enc.put_u8(self.endian.marker());
        enc.put_u8(self.message_type as u8);
        enc.put_u8(self.flags.bits());
        enc.put_u8(PROTOCOL_VERSION);
        enc.put_u32(body_len);
        enc.put_u32(self.serial);
        enc.encode(&fields, &fields_type)?;
        enc.pad_to(8);

        let mut bytes = enc.into_bytes();
        bytes.extend_from_slice(&body);
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(BusError::OversizedMessage {
                size: bytes.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Compute the total frame length from the first [`FIXED_HEADER_LEN`] bytes.
    ///
    /// Validates the byte order marker, message type and protocol version so that a
    /// corrupt stream is rejected before any more input is buffered.
    pub fn frame_length(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < FIXED_HEADER_LEN {
            return Err(BusError::codec(constants::ERR_TRUNCATED));
        }
        let endian =
            Endian::from_marker(prefix[0]).ok_or_else(|| BusError::framing(constants::ERR_INVALID_ENDIAN))?;
        MessageType::try_from(prefix[1])?;
        if prefix[3] != PROTOCOL_VERSION {
            return Err(BusError::UnsupportedVersion(prefix[3]));
        }

        let mut dec = Decoder::new(prefix, 4, endian);
        let body_len = dec.read_u32()? as u64;
        let _serial = dec.read_u32()?;
        let fields_len = dec.read_u32()? as u64;

        let header_end = FIXED_HEADER_LEN as u64 + fields_len;
        let total = header_end + padding_for(header_end as usize, 8) as u64 + body_len;
        usize::try_from(total).map_err(|_| BusError::OversizedMessage {
            size: usize::MAX,
            limit: MAX_MESSAGE_SIZE,
        })
    }

    /// Parse one complete frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let frame_len = Self::frame_length(bytes)?;
        if bytes.len() != frame_len {
            return Err(BusError::Framing(format!(
                "frame declares {frame_len} bytes, got {}",
                bytes.len()
            )));
        }

        let endian =
            Endian::from_marker(bytes[0]).ok_or_else(|| BusError::framing(constants::ERR_INVALID_ENDIAN))?;
        let mut msg = Self::empty(MessageType::try_from(bytes[1])?);
        msg.endian = endian;
        msg.flags = MessageFlags::from_bits_truncate(bytes[2]);

        let mut dec = Decoder::new(bytes, 4, endian);
        let body_len = dec.read_u32()? as usize;
        msg.serial = dec.read_u32()?;
        if msg.serial == 0 {
            return Err(BusError::framing(constants::ERR_ZERO_SERIAL));
        }

        let fields = dec.decode(&header_fields_type())?;
        if let Value::Array(fields) = fields {
            for entry in fields.into_items() {
                msg.apply_header_field(entry)?;
            }
        }
        dec.align(8)?;
        let body_start = dec.position();

        let body = &bytes[body_start..];
        if body.len() != body_len {
            return Err(BusError::framing(constants::ERR_BODY_LENGTH));
        }
        let (values, consumed) = marshal::decode(body, &msg.signature, 0, endian)?;
        if consumed != body_len {
            return Err(BusError::framing(constants::ERR_BODY_LENGTH));
        }
        msg.body = values;

        msg.validate()?;
        Ok(msg)
    }

    fn apply_header_field(&mut self, entry: Value) -> Result<()> {
        let Value::Struct(mut parts) = entry else {
            return Err(BusError::framing("malformed header field"));
        };
        let (Some(Value::Variant(value)), Some(Value::Byte(code))) = (parts.pop(), parts.pop())
        else {
            return Err(BusError::framing("malformed header field"));
        };

        let wrong_type = || BusError::Framing(format!("header field {code} has the wrong type"));
        match (code, *value) {
            (field::PATH, Value::ObjectPath(p)) => self.path = Some(p),
            (field::INTERFACE, Value::Str(s)) => self.interface = Some(s),
            (field::MEMBER, Value::Str(s)) => self.member = Some(s),
            (field::ERROR_NAME, Value::Str(s)) => self.error_name = Some(s),
            (field::REPLY_SERIAL, Value::UInt32(v)) => self.reply_serial = Some(v),
            (field::DESTINATION, Value::Str(s)) => self.destination = Some(s),
            (field::SENDER, Value::Str(s)) => self.sender = Some(s),
            (field::SIGNATURE, Value::Signature(g)) => self.signature = g,
            (field::PATH..=field::SIGNATURE, _) => return Err(wrong_type()),
            // Unknown fields are ignored for forward compatibility
            _ => {}
        }
        Ok(())
    }
}
