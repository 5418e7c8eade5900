//! Shared helpers for flight integration tests.

#![allow(unused)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use dflight::buffer::Buf;
use dflight::codec::{encode_fragment, write_legacy_header, CodecMode, FragmentHeader, RecordHeader, DTLS1_2};
use dflight::crypto::StaticKeys;
use dflight::{
    Config, Connection, ContentType, HandshakeKind, MessageType, Output, Protocol, Role, MAX_MTU,
};

/// Collected outputs from polling an endpoint until it has nothing more.
#[derive(Default, Debug)]
pub struct DrainedOutputs {
    pub packets: Vec<Vec<u8>>,
    pub connected: bool,
    pub messages: Vec<MessageType>,
    pub app_data: Vec<Vec<u8>>,
    pub early_data: Vec<Vec<u8>>,
    pub timeout: Option<Instant>,
}

/// Poll until `Timeout` or `Idle`, collecting everything.
pub fn drain_outputs(endpoint: &mut Connection) -> DrainedOutputs {
    let mut result = DrainedOutputs::default();
    let mut buf = vec![0u8; MAX_MTU];
    loop {
        match endpoint.poll_output(&mut buf) {
            Output::Packet(p) => result.packets.push(p.to_vec()),
            Output::Connected => result.connected = true,
            Output::HandshakeMessage(t) => result.messages.push(t),
            Output::ApplicationData(data) => result.app_data.push(data.to_vec()),
            Output::EarlyData(data) => result.early_data.push(data.to_vec()),
            Output::Timeout(t) => {
                result.timeout = Some(t);
                break;
            }
            Output::Idle => break,
        }
    }
    result
}

/// Poll until `Timeout` or `Idle`, collecting only packets.
pub fn collect_packets(endpoint: &mut Connection) -> Vec<Vec<u8>> {
    drain_outputs(endpoint).packets
}

/// Deliver packets, failing the test on any error.
pub fn deliver_packets(packets: &[Vec<u8>], dest: &mut Connection, now: Instant) {
    for p in packets {
        dest.handle_packet(p, now).expect("handle_packet");
    }
}

pub fn config(protocol: Protocol, handshake: HandshakeKind) -> Config {
    Config::builder()
        .protocol(protocol)
        .handshake(handshake)
        .build()
        .expect("Failed to build config")
}

pub fn dtls12_config() -> Config {
    config(Protocol::Dtls12, HandshakeKind::Full)
}

pub fn dtls13_config() -> Config {
    config(Protocol::Dtls13, HandshakeKind::Full)
}

/// A client and a server sharing `config` and keys.
pub fn endpoints(config: Config) -> (Connection, Connection) {
    let config = Arc::new(config);
    let client = Connection::new(Arc::clone(&config), Role::Client, Box::new(StaticKeys::new(42)));
    let server = Connection::new(config, Role::Server, Box::new(StaticKeys::new(42)));
    (client, server)
}

/// Run a lossless handshake at `now`. Returns the outputs seen by each side.
pub fn handshake(
    client: &mut Connection,
    server: &mut Connection,
    now: Instant,
) -> (DrainedOutputs, DrainedOutputs) {
    let mut client_seen = DrainedOutputs::default();
    let mut server_seen = DrainedOutputs::default();

    client.handle_timeout(now).expect("client start");

    for _ in 0..16 {
        let out = drain_outputs(client);
        merge(&mut client_seen, &out);
        deliver_packets(&out.packets, server, now);

        let out = drain_outputs(server);
        merge(&mut server_seen, &out);
        deliver_packets(&out.packets, client, now);

        if out.packets.is_empty() && client.is_connected() && server.is_connected() {
            break;
        }
    }

    assert!(client.is_connected(), "client not connected: {:?}", client.state());
    assert!(server.is_connected(), "server not connected: {:?}", server.state());
    (client_seen, server_seen)
}

fn merge(into: &mut DrainedOutputs, from: &DrainedOutputs) {
    into.connected |= from.connected;
    into.messages.extend_from_slice(&from.messages);
    into.app_data.extend(from.app_data.iter().cloned());
    into.early_data.extend(from.early_data.iter().cloned());
}

/// A plaintext legacy record.
pub fn record(content_type: ContentType, epoch: u16, sequence: u64, body: &[u8]) -> Vec<u8> {
    let header = RecordHeader {
        content_type,
        version: DTLS1_2,
        epoch,
        sequence,
        length: body.len() as u16,
    };
    let mut out = Buf::new();
    write_legacy_header(&header, &mut out);
    out.extend_from_slice(body);
    out.into_vec()
}

/// A whole handshake message as one legacy fragment.
pub fn handshake_fragment(msg_type: MessageType, message_seq: u16, body: &[u8]) -> Vec<u8> {
    let header = FragmentHeader {
        msg_type,
        total_len: body.len() as u32,
        message_seq,
        offset: 0,
        length: body.len() as u32,
    };
    let mut out = Buf::new();
    encode_fragment(&header, body, CodecMode::Legacy, &mut out);
    out.into_vec()
}
