#![no_main]

//! Fuzz target for the packet path.
//!
//! Feeds arbitrary datagrams to a fresh server and to a client that has
//! sent its first flight, for both protocol versions. Errors are expected,
//! panics are not.

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use std::time::Instant;

use dflight::codec::CodecMode;
use dflight::crypto::StaticKeys;
use dflight::{Config, Connection, Output, Protocol, Role};

fuzz_target!(|data: &[u8]| {
    let configs = [
        Config::builder().protocol(Protocol::Dtls12).build(),
        Config::builder().build(),
        Config::builder().codec_mode(CodecMode::Compact).build(),
    ];

    let now = Instant::now();
    let mut buf = vec![0u8; 2048];

    for config in configs.into_iter().flatten() {
        let config = Arc::new(config);

        // Servers can receive packets immediately
        {
            let mut server = Connection::new(
                Arc::clone(&config),
                Role::Server,
                Box::new(StaticKeys::new(1)),
            );
            let _ = server.handle_packet(data, now);
            drain(&mut server, &mut buf);
        }

        // Clients need handle_timeout first to send their ClientHello
        {
            let mut client = Connection::new(config, Role::Client, Box::new(StaticKeys::new(1)));
            let _ = client.handle_timeout(now);
            drain(&mut client, &mut buf);
            let _ = client.handle_packet(data, now);
            drain(&mut client, &mut buf);
        }
    }
});

fn drain(conn: &mut Connection, buf: &mut [u8]) {
    // Bounded to catch output loops.
    for _ in 0..256 {
        match conn.poll_output(buf) {
            Output::Timeout(_) | Output::Idle => return,
            _ => {}
        }
    }
    panic!("poll_output did not settle");
}
