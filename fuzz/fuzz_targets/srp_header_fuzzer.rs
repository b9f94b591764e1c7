//! SRP header parsing on arbitrary bytes: no panics, and every accepted
//! header survives an encode/parse round trip.

#![no_main]

use framelink_proto::srp::SrpHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = SrpHeader::parse(data) {
        let mut wire = [0u8; 20];
        if header.encode(&mut wire).is_ok() {
            let reparsed = SrpHeader::parse(&wire).expect("emitted headers parse");
            assert_eq!(reparsed.id, header.id);
            assert_eq!(reparsed.address, header.address);
            assert_eq!(reparsed.size, header.size);
            assert_eq!(reparsed.kind, header.kind);
        }
    }
});
