//! RSSI header parsing must never panic and must reject any header whose
//! checksum does not validate.

#![no_main]

use framelink_proto::rssi::Segment;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes: parse either fails cleanly or yields a segment
    // whose re-encoded header round-trips.
    if let Ok(segment) = Segment::parse(data) {
        use framelink_proto::rssi::{encode_plain, encode_syn};

        let mut wire = [0u8; 24];
        let ok = match &segment.syn {
            Some(params) => {
                encode_syn(segment.flags, segment.sequence, segment.acknowledge, params, &mut wire)
                    .is_ok()
            },
            None => {
                encode_plain(segment.flags, segment.sequence, segment.acknowledge, &mut wire)
                    .is_ok()
            },
        };
        assert!(ok);

        let reparsed = Segment::parse(&wire).expect("emitted headers validate");
        assert_eq!(reparsed.sequence, segment.sequence);
        assert_eq!(reparsed.acknowledge, segment.acknowledge);
    }
});
