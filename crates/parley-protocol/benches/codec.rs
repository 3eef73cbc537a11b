//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, Message, RoomId, ServerEvent};

fn new_message(text_len: usize) -> ServerEvent {
    ServerEvent::NewMessage(Message::new(
        RoomId::generate(),
        "u1".into(),
        "x".repeat(text_len),
    ))
}

fn bench_encode_text(c: &mut Criterion) {
    let event = new_message(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("json_64B", |b| b.iter(|| codec::encode_text(black_box(&event))));
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::encode_binary(black_box(&event)))
    });
    group.finish();
}

fn bench_decode_text(c: &mut Criterion) {
    let text = r#"{"event":"sendMessage","data":{"receiverId":"u2","text":"hello there"}}"#;

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("json_send_message", |b| {
        b.iter(|| codec::decode_text(black_box(text)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode_text, bench_decode_text);
criterion_main!(benches);
