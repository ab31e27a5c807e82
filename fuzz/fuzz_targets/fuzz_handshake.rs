#![no_main]

use bus_protocol::protocol::handshake::{AuthMechanism, ClientHandshake};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary server lines to the client state machine
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let mut handshake = ClientHandshake::new(AuthMechanism::External).with_identity(1000);
    if handshake.start().is_err() {
        return;
    }
    for line in text.split("\r\n") {
        if handshake.on_line(line).is_err() {
            break;
        }
    }
    let _ = handshake.begin();
});
