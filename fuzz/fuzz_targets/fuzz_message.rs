#![no_main]

use bus_protocol::core::codec::MessageCodec;
use bus_protocol::Message;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Frame parsing must never panic, loop, or over-allocate
    if let Ok(msg) = Message::from_bytes(data) {
        // Anything that parsed must encode again
        let bytes = msg.to_bytes().expect("parsed message re-encodes");
        let _ = Message::from_bytes(&bytes).expect("re-encoded message parses");
    }

    let mut codec = MessageCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
    let _ = codec.decode_eof(&mut buf);
});
