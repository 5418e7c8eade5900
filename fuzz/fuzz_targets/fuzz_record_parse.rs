#![no_main]

//! Fuzz target for the legacy record and fragment codecs.
//!
//! Splits the input into records, then parses every record body as
//! handshake fragments, an ACK, a ChangeCipherSpec and an alert. Inputs
//! that parse must survive re-encoding.

use libfuzzer_sys::fuzz_target;

use dflight::buffer::Buf;
use dflight::codec::{
    decode_fragments, encode_fragment, parse_alert, parse_change_cipher_spec, split_datagram,
    Ack, CodecMode,
};

/// DTLS record header length
const DTLS_HEADER_LEN: usize = 13;

fuzz_target!(|data: &[u8]| {
    if let Ok(records) = split_datagram(data, CodecMode::Legacy) {
        for record in records.iter() {
            assert_eq!(record.header_bytes.len(), DTLS_HEADER_LEN);
            exercise_body(record.body);
        }
    }

    // The raw input as a record body too.
    exercise_body(data);
});

fn exercise_body(body: &[u8]) {
    if let Ok(fragments) = decode_fragments(body, CodecMode::Legacy, 0) {
        let mut out = Buf::new();
        for f in &fragments {
            encode_fragment(&f.header(), &f.data, CodecMode::Legacy, &mut out);
        }
        let again =
            decode_fragments(&out, CodecMode::Legacy, 0).expect("re-encoded fragments parse");
        assert_eq!(again, fragments);
    }

    if let Ok(ack) = Ack::parse(body) {
        let mut out = Buf::new();
        ack.serialize(&mut out);
        assert_eq!(Ack::parse(&out).expect("re-encoded ACK parses"), ack);
    }

    let _ = parse_change_cipher_spec(body);
    let _ = parse_alert(body);
}
