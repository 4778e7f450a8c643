use bytes::BytesMut;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use memory::GlobalPtr;
use pgas_runtime_codec::{Header, MESSAGE_SIZE, Message, Opcode};

fn criterion_benchmark(c: &mut Criterion) {
    let message = Message {
        header: Header {
            opcode: Opcode::Put,
            len: 4096,
            src: 0,
            dst: 1,
            request_id: 1,
        },
        ptr: GlobalPtr::new(1, 0x1000),
        size: 4096,
        value: 0,
    };

    let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
    message.encode(&mut buf);
    let encoded = buf.clone().freeze();

    let mut wire_criterion = c.benchmark_group("wire");

    wire_criterion.throughput(Throughput::Elements(1));
    wire_criterion.bench_function("encode", |bencher| {
        bencher.iter(|| {
            message.encode(&mut buf);
        })
    });

    wire_criterion.bench_function("decode", |bencher| {
        bencher.iter(|| {
            Message::decode(&encoded).unwrap();
        })
    });

    wire_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
