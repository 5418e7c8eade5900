#![no_main]

//! Fuzz target for the DTLS 1.3 unified header and compact fragment codecs.

use libfuzzer_sys::fuzz_target;

use dflight::codec::{decode_fragments, split_datagram, CodecMode, RawHeader};

fuzz_target!(|data: &[u8]| {
    if let Ok(records) = split_datagram(data, CodecMode::Compact) {
        for record in records.iter() {
            if let RawHeader::Unified(h) = record.header {
                assert_eq!(record.header_bytes.len(), h.encoded_len());
                if let Some(len) = h.length {
                    assert_eq!(record.body.len(), len as usize);
                }
            }
            let _ = decode_fragments(record.body, CodecMode::Compact, 2);
        }
    }

    let _ = decode_fragments(data, CodecMode::Compact, 2);
});
