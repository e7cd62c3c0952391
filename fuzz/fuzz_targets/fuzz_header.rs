#![no_main]

use libfuzzer_sys::fuzz_target;
use mbserver::{validate_header, ModbusHeader, ProtocolError};

fuzz_target!(|data: [u8; 8]| {
    let prefix: [u8; 6] = [data[0], data[1], data[2], data[3], data[4], data[5]];
    let protocol_id = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]);

    match validate_header(&prefix) {
        Ok(n) => {
            assert_eq!(protocol_id, 0);
            assert_eq!(n, length);
            assert!(n <= 255);
        }
        Err(ProtocolError::NonZeroProtocolId(p)) => assert_eq!(p, protocol_id),
        Err(ProtocolError::LengthTooLarge(l)) => {
            assert_eq!(protocol_id, 0);
            assert_eq!(l, length);
        }
    }

    let header = ModbusHeader::decode(&data).expect("eight bytes always decode");
    let mut out = [0u8; 8];
    header.encode(&mut out).expect("eight byte buffer");
    assert_eq!(out, data);
});
