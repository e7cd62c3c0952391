//! Dispatch hot path benchmarks
//!
//! Measures one request through the function table: header decode, lock,
//! handler, in-place response.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use mbserver::{Frame, FunctionTable, MemoryDataPlane, ModbusStatistics, SharedDataPlane};

fn table() -> FunctionTable {
    FunctionTable::new(
        SharedDataPlane::new(MemoryDataPlane::default()),
        Arc::new(ModbusStatistics::new()),
    )
}

fn read_registers_request(count: u16) -> Vec<u8> {
    let mut frame = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00];
    frame.extend_from_slice(&count.to_be_bytes());
    frame
}

fn write_registers_request(count: u16) -> Vec<u8> {
    let byte_count = (count * 2) as u8;
    let length = 7 + byte_count as u16;
    let mut frame = vec![0x00, 0x01, 0x00, 0x00];
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&[0x01, 0x10, 0x00, 0x00]);
    frame.extend_from_slice(&count.to_be_bytes());
    frame.push(byte_count);
    for i in 0..count {
        frame.extend_from_slice(&i.to_be_bytes());
    }
    frame
}

fn bench_read_registers(c: &mut Criterion) {
    let table = table();
    let mut group = c.benchmark_group("read_registers");

    for count in [1u16, 10, 125] {
        let request = read_registers_request(count);
        group.bench_function(format!("fc03_{}", count), |b| {
            b.iter_batched_ref(
                || Frame::from_slice(&request).unwrap(),
                |frame| black_box(table.dispatch(frame).unwrap()),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_write_registers(c: &mut Criterion) {
    let table = table();
    let mut group = c.benchmark_group("write_registers");

    for count in [1u16, 100] {
        let request = write_registers_request(count);
        group.bench_function(format!("fc16_{}", count), |b| {
            b.iter_batched_ref(
                || Frame::from_slice(&request).unwrap(),
                |frame| black_box(table.dispatch(frame).unwrap()),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_exception(c: &mut Criterion) {
    let table = table();
    let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x99];
    c.bench_function("unsupported_function", |b| {
        b.iter_batched_ref(
            || Frame::from_slice(&request).unwrap(),
            |frame| black_box(table.dispatch(frame).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_read_registers,
    bench_write_registers,
    bench_exception
);
criterion_main!(benches);
