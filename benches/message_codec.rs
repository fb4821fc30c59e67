use criterion::{black_box, criterion_group, criterion_main, Criterion};
use watershed::message::{Message, OpCode};

fn encode_decode_round_trip(c: &mut Criterion) {
    let payload = vec![0u8; 4096];
    let message = Message::new(OpCode::ModuleData, payload)
        .unwrap()
        .with_source(3)
        .with_sequence_number(42)
        .with_source_stream("bench-stream")
        .unwrap();

    c.bench_function("message_encode_4k", |b| {
        b.iter(|| black_box(message.encode().unwrap()));
    });

    let encoded = message.encode().unwrap();
    let mut header = [0u8; watershed::message::HEADER_LEN_BYTES];
    header.copy_from_slice(&encoded[..watershed::message::HEADER_LEN_BYTES]);

    c.bench_function("message_decode_header", |b| {
        b.iter(|| black_box(Message::decode_header(&header).unwrap()));
    });
}

criterion_group!(benches, encode_decode_round_trip);
criterion_main!(benches);
