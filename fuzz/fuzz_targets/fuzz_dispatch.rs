#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use mbserver::udp::check_datagram;
use mbserver::{
    Frame, FunctionTable, ImageSize, MemoryDataPlane, ModbusStatistics, SharedDataPlane,
};

// Feed arbitrary datagrams through the same gate the UDP server uses, then
// dispatch. Whatever the request, a response must keep the request's
// transaction id and unit id and carry a consistent length field.
fuzz_target!(|data: &[u8]| {
    if check_datagram(data).is_err() {
        return;
    }
    let Ok(mut frame) = Frame::from_slice(data) else {
        return;
    };

    let image = MemoryDataPlane::new(ImageSize {
        coils: 64,
        discrete_inputs: 64,
        holding_registers: 64,
        input_registers: 64,
    });
    let table = FunctionTable::new(
        SharedDataPlane::new(image),
        Arc::new(ModbusStatistics::new()),
    );

    let len = table
        .dispatch(&mut frame)
        .expect("complete frames always get a response");
    let response = frame.as_slice();

    assert_eq!(len, response.len());
    assert!(len >= 9);
    assert_eq!(&response[..2], &data[..2]);
    assert_eq!(&response[2..4], &[0, 0]);
    assert_eq!(u16::from_be_bytes([response[4], response[5]]) as usize, len - 6);
    assert_eq!(response[6], data[6]);
    assert_eq!(response[7] & 0x7F, data[7] & 0x7F);
});
