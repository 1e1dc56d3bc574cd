#![forbid(unsafe_code)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sombra_durable::operation::{
    DiscardTarget, ExecMode, FeedOutcome, OpBlock, OperationParser, Operator, ParserOptions,
};
use sombra_durable::primitives::buffer::OperationBuffer;
use sombra_durable::replication::{write_transaction, SerialSequence};
use sombra_durable::types::now_millis;
use sombra_durable::{ObjectId, OpId};

const BLOCKS_PER_TX: usize = 64;

fn op_stream(transactions: usize) -> Vec<u8> {
    let graph = ObjectId::from_name("bench");
    let mut seq = SerialSequence::starting_at(1, 1);
    let mut out = OperationBuffer::with_capacity_order(20, "bench");
    let mut stream = Vec::new();
    for t in 0..transactions {
        let mut data = Vec::new();
        for b in 0..BLOCKS_PER_TX {
            let name = format!("vertex-{t}-{b}");
            let mut block = OpBlock::for_vertex(graph, ObjectId::from_name(&name));
            block.push(Operator::vertex_new(&name, 0x11, 0, 0));
            block.push(Operator::set_rank((t * BLOCKS_PER_TX + b) as u64));
            block.opid = OpId((t * BLOCKS_PER_TX + b + 1) as u64);
            data.extend(block.to_bytes());
        }
        let tx = write_transaction(&mut out, &mut seq, &data, 0, now_millis()).expect("frame");
        stream.extend(out.peek(tx.tsize));
        out.advance_read(tx.tsize);
        out.confirm(tx.tsize).expect("confirm");
    }
    stream
}

fn buffer_cycle(c: &mut Criterion) {
    let stream = op_stream(4);
    let mut group = c.benchmark_group("op_buffer");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    for order in [12u32, 16] {
        group.bench_with_input(BenchmarkId::new("write_read_confirm", order), &order, |b, &order| {
            let mut buffer = OperationBuffer::with_capacity_order(order, "cycle");
            b.iter(|| {
                for chunk in stream.chunks(1 << (order - 2)) {
                    buffer.write(chunk).expect("write");
                    while let Some(line) = buffer.read_until(4096, b'\n') {
                        buffer.confirm(line.len()).expect("confirm");
                    }
                }
                buffer.clear();
            });
        });
    }
    group.finish();
}

fn parser_feed(c: &mut Criterion) {
    let stream = op_stream(16);
    let mut group = c.benchmark_group("parser");
    group.sample_size(30);
    group.throughput(Throughput::Bytes(stream.len() as u64));
    for validate in [true, false] {
        group.bench_with_input(BenchmarkId::new("simulate", validate), &validate, |b, &validate| {
            b.iter(|| {
                let mut parser = OperationParser::new(ParserOptions {
                    exec: ExecMode::Simulate,
                    validate,
                    ..ParserOptions::default()
                });
                let mut input = OperationBuffer::with_capacity_order(20, "parser");
                let mut target = DiscardTarget;
                input.write(&stream).expect("write");
                while parser.feed(&mut input, &mut target) == FeedOutcome::Yielded {}
                parser.stats().operations
            });
        });
    }
    group.finish();
}

criterion_group!(benches, buffer_cycle, parser_feed);
criterion_main!(benches);
