use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use prv_core::{codec, validation};
use prv_testkit::all_vectors;

fn encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for v in all_vectors() {
        group.bench_with_input(BenchmarkId::from_parameter(v.pdu.kind().name()), &v.pdu, |b, pdu| {
            b.iter(|| codec::encode(black_box(pdu)))
        });
    }
    group.finish();
}

fn decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for v in all_vectors() {
        let text = codec::encode(&v.pdu);
        group.bench_with_input(BenchmarkId::from_parameter(v.pdu.kind().name()), &text, |b, text| {
            b.iter(|| codec::decode(black_box(text.as_bytes())))
        });
    }
    group.finish();
}

fn detect(c: &mut Criterion) {
    let frame = codec::encode(&all_vectors()[2].pdu);
    c.bench_function("is_protocol_message/frame", |b| {
        b.iter(|| codec::is_protocol_message(black_box(frame.as_bytes())))
    });
    c.bench_function("is_protocol_message/chat", |b| {
        b.iter(|| codec::is_protocol_message(black_box(b"see you at the standup")))
    });
}

fn validate(c: &mut Criterion) {
    let vectors = all_vectors();
    c.bench_function("validate_pdu/all", |b| {
        b.iter(|| {
            for v in &vectors {
                let _ = validation::validate_pdu(black_box(&v.pdu));
            }
        })
    });
}

criterion_group!(benches, encode, decode, detect, validate);
criterion_main!(benches);
