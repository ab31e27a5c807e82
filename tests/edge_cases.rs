#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for the wire format
//! Hand-built frames, nesting limits, header field quirks, and name boundaries

use bus_protocol::core::marshal::{self, padding_for};
use bus_protocol::core::signature::Type;
use bus_protocol::core::value::signature_of;
use bus_protocol::{Array, BusError, Endian, Message, MessageFlags, MessageType, ObjectPath, Signature, Value};

// ============================================================================
// HAND-BUILT FRAMES
// ============================================================================

const PATH: u8 = 1;
const INTERFACE: u8 = 2;
const MEMBER: u8 = 3;
const SIGNATURE: u8 = 8;

/// Assemble a frame from raw header fields and an already-typed body
fn raw_frame(message_type: u8, serial: u32, fields: Vec<(u8, Value)>, body: &[Value]) -> Vec<u8> {
    let endian = Endian::Little;
    let body_sig = signature_of(body).unwrap();
    let body_bytes = marshal::encode(body, &body_sig, endian).unwrap();

    let field_type = Type::Struct(vec![Type::Byte, Type::Variant]);
    let entries = fields
        .into_iter()
        .map(|(code, value)| Value::Struct(vec![Value::Byte(code), Value::variant(value)]))
        .collect();
    let header = vec![
        Value::Byte(endian.marker()),
        Value::Byte(message_type),
        Value::Byte(0),
        Value::Byte(1),
        Value::UInt32(body_bytes.len() as u32),
        Value::UInt32(serial),
        Value::Array(Array::from_values(field_type, entries).unwrap()),
    ];
    let mut bytes = marshal::encode(&header, &signature_of(&header).unwrap(), endian).unwrap();
    bytes.resize(bytes.len() + padding_for(bytes.len(), 8), 0);
    bytes.extend_from_slice(&body_bytes);
    bytes
}

fn signal_fields() -> Vec<(u8, Value)> {
    vec![
        (PATH, Value::ObjectPath(ObjectPath::new("/org/example").unwrap())),
        (INTERFACE, Value::from("org.example.Iface")),
        (MEMBER, Value::from("Ping")),
    ]
}

#[test]
fn test_hand_built_frame_matches_encoder() {
    let bytes = raw_frame(4, 3, signal_fields(), &[]);
    let msg = Message::from_bytes(&bytes).unwrap();

    assert_eq!(msg.message_type, MessageType::Signal);
    assert_eq!(msg.member.as_deref(), Some("Ping"));
    assert_eq!(msg.to_bytes().unwrap(), bytes);
}

#[test]
fn test_unknown_header_field_ignored() {
    let mut fields = signal_fields();
    fields.push((200, Value::from("from the future")));
    let bytes = raw_frame(4, 5, fields, &[]);

    let msg = Message::from_bytes(&bytes).unwrap();
    assert_eq!(msg.interface.as_deref(), Some("org.example.Iface"));
    // Re-encoding drops the unknown field
    assert!(msg.to_bytes().unwrap().len() < bytes.len());
}

#[test]
fn test_known_header_field_with_wrong_type() {
    let mut fields = signal_fields();
    fields[0] = (PATH, Value::from("/org/example"));
    let err = Message::from_bytes(&raw_frame(4, 5, fields, &[])).unwrap_err();
    assert!(matches!(err, BusError::Framing(ref m) if m.contains("wrong type")));
}

#[test]
fn test_signal_without_member() {
    let mut fields = signal_fields();
    fields.retain(|(code, _)| *code != MEMBER);
    let err = Message::from_bytes(&raw_frame(4, 5, fields, &[])).unwrap_err();
    assert!(matches!(err, BusError::Framing(ref m) if m.contains("MEMBER")));
}

#[test]
fn test_error_without_reply_serial() {
    let fields = vec![(4, Value::from("org.example.Error.Broken"))];
    let err = Message::from_bytes(&raw_frame(3, 5, fields, &[])).unwrap_err();
    assert!(matches!(err, BusError::Framing(ref m) if m.contains("REPLY_SERIAL")));
}

#[test]
fn test_body_without_signature_field() {
    let err = Message::from_bytes(&raw_frame(4, 5, signal_fields(), &[Value::UInt32(1)])).unwrap_err();
    assert!(matches!(err, BusError::Framing(_)));
}

#[test]
fn test_signature_field_longer_than_body() {
    let mut fields = signal_fields();
    fields.push((SIGNATURE, Value::Signature(Signature::new("uu").unwrap())));
    let err = Message::from_bytes(&raw_frame(4, 5, fields, &[Value::UInt32(1)])).unwrap_err();
    assert!(matches!(err, BusError::Codec(_) | BusError::Framing(_)));
}

#[test]
fn test_zero_serial_on_the_wire() {
    let err = Message::from_bytes(&raw_frame(4, 0, signal_fields(), &[])).unwrap_err();
    assert!(matches!(err, BusError::Framing(_)));
}

#[test]
fn test_unknown_flag_bits_dropped() {
    let mut bytes = raw_frame(4, 5, signal_fields(), &[]);
    bytes[2] = 0x81;
    let msg = Message::from_bytes(&bytes).unwrap();
    assert_eq!(msg.flags, MessageFlags::NO_REPLY_EXPECTED);
}

#[test]
fn test_trailing_garbage_rejected() {
    let mut bytes = raw_frame(4, 5, signal_fields(), &[]);
    bytes.push(0);
    assert!(Message::from_bytes(&bytes).is_err());
}

// ============================================================================
// BODY VALUES
// ============================================================================

#[test]
fn test_empty_body() {
    let mut msg = Message::method_call("/", "Ping").unwrap();
    msg.serial = u32::MAX;
    let bytes = msg.to_bytes().unwrap();

    assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
    let decoded = Message::from_bytes(&bytes).unwrap();
    assert!(decoded.body.is_empty());
    assert!(decoded.signature.is_empty());
    assert_eq!(decoded.serial, u32::MAX);
}

#[test]
fn test_properties_dictionary() {
    let props = Value::dict(
        Type::Str,
        Type::Variant,
        vec![
            (Value::from("Volume"), Value::variant(Value::Double(0.5))),
            (Value::from("Muted"), Value::variant(false)),
            (
                Value::from("Tags"),
                Value::variant(Value::array(Type::Str, vec![Value::from("a"), Value::from("")]).unwrap()),
            ),
        ],
    )
    .unwrap();

    let mut msg = Message::signal("/org/example/Player", "org.freedesktop.DBus.Properties", "PropertiesChanged")
        .unwrap()
        .with_body(vec![
            Value::from("org.example.Player"),
            props,
            Value::array(Type::Str, vec![]).unwrap(),
        ])
        .unwrap();
    msg.serial = 11;

    assert_eq!(msg.signature.as_str(), "sa{sv}as");
    let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn test_empty_array_of_structs_in_big_endian() {
    let element = Type::Struct(vec![Type::Int64, Type::Byte]);
    let mut msg = Message::signal("/o", "org.example.I", "Empty")
        .unwrap()
        .with_body(vec![Value::Byte(1), Value::array(element, vec![]).unwrap()])
        .unwrap()
        .with_endian(Endian::Big);
    msg.serial = 2;

    let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded.body, msg.body);
    assert_eq!(decoded.endian, Endian::Big);
}

#[test]
fn test_variant_nesting_limit() {
    let mut deep = Value::Byte(7);
    for _ in 0..70 {
        deep = Value::variant(deep);
    }
    let sig = Signature::new("v").unwrap();
    assert!(matches!(
        marshal::encode(&[deep], &sig, Endian::Little),
        Err(BusError::Codec(_))
    ));

    // Same shape built by hand: each level is a one-byte signature "v"
    let mut bytes = Vec::new();
    for _ in 0..70 {
        bytes.extend_from_slice(&[1, b'v', 0]);
    }
    bytes.extend_from_slice(&[1, b'y', 0, 7]);
    assert!(matches!(
        marshal::decode(&bytes, &sig, 0, Endian::Little),
        Err(BusError::Codec(_))
    ));

    let shallow = [1, b'v', 0, 1, b'y', 0, 7];
    let (values, consumed) = marshal::decode(&shallow, &sig, 0, Endian::Little).unwrap();
    assert_eq!(consumed, shallow.len());
    assert_eq!(values[0].inner(), &Value::Byte(7));
}

#[test]
fn test_array_depth_limit_in_signatures() {
    let ok = format!("{}y", "a".repeat(32));
    let too_deep = format!("{}y", "a".repeat(33));
    assert!(Signature::new(&ok).is_ok());
    assert!(Signature::new(&too_deep).is_err());
}

#[test]
fn test_string_with_multibyte_utf8() {
    let text = "grüße, 世界";
    let mut msg = Message::signal("/o", "org.example.I", "Text")
        .unwrap()
        .with_body(vec![Value::from(text)])
        .unwrap();
    msg.serial = 1;

    let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded.body[0].as_str(), Some(text));
}

// ============================================================================
// NAMES
// ============================================================================

#[test]
fn test_member_name_length_boundary() {
    let longest = format!("M{}", "x".repeat(254));
    assert!(Message::method_call("/", &longest).is_ok());
    let too_long = format!("M{}", "x".repeat(255));
    assert!(matches!(
        Message::method_call("/", &too_long),
        Err(BusError::InvalidName(_))
    ));
}

#[test]
fn test_object_path_shapes() {
    for good in ["/", "/a", "/a/b_c/D9"] {
        assert!(ObjectPath::new(good).is_ok(), "{good}");
    }
    for bad in ["", "a", "//", "/a/", "/a//b", "/a-b"] {
        assert!(ObjectPath::new(bad).is_err(), "{bad}");
    }
}

#[test]
fn test_interface_needs_two_elements() {
    let call = Message::method_call("/", "Get").unwrap();
    assert!(call.clone().with_interface("org.example").is_ok());
    assert!(call.clone().with_interface("example").is_err());
    assert!(call.clone().with_interface("org..example").is_err());
    assert!(call.with_interface("org.9example").is_err());
}

#[test]
fn test_destination_accepts_unique_and_well_known() {
    let call = Message::method_call("/", "Get").unwrap();
    assert!(call.clone().with_destination(":1.42").is_ok());
    assert!(call.clone().with_destination("org.freedesktop.DBus").is_ok());
    assert!(call.clone().with_destination("org.example-app.Service").is_ok());
    assert!(call.with_destination("nodots").is_err());
}
