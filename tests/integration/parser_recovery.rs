#![allow(missing_docs)]

use sombra_durable::graph::{GraphContext, GraphExecutor};
use sombra_durable::operation::{FeedOutcome, OpBlock, OperationParser, Operator, ParserOptions};
use sombra_durable::primitives::buffer::OperationBuffer;
use sombra_durable::replication::{write_transaction, SerialSequence};
use sombra_durable::types::now_millis;
use sombra_durable::{ObjectId, OpId, Result};

fn vertex_block(graph: ObjectId, name: &str, rank: u64, opid: u64) -> Vec<u8> {
    let mut block = OpBlock::for_vertex(graph, ObjectId::from_name(name));
    block.push(Operator::vertex_new(name, 0x11, 0, 0));
    block.push(Operator::set_rank(rank));
    block.opid = OpId(opid);
    block.to_bytes()
}

fn framed(seq: &mut SerialSequence, blocks: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut out = OperationBuffer::with_capacity_order(12, "tx");
    let tx = write_transaction(&mut out, seq, &blocks.concat(), 0, now_millis())?;
    Ok(out.peek(tx.tsize))
}

fn find(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("needle present")
}

fn replay(ctx: &std::sync::Arc<GraphContext>, bytes: &[u8]) -> Result<OperationParser> {
    let mut parser = OperationParser::new(ParserOptions::default());
    let mut target = GraphExecutor::new(std::sync::Arc::clone(ctx));
    let mut input = OperationBuffer::with_capacity_order(12, "input");
    input.write(bytes)?;
    while parser.feed(&mut input, &mut target) == FeedOutcome::Yielded {}
    Ok(parser)
}

#[test]
fn single_bit_flip_loses_only_the_damaged_block() -> Result<()> {
    let ctx = GraphContext::new("replica");
    let graph = ctx.obid();
    let mut seq = SerialSequence::starting_at(100, 7);
    let mut stream = framed(
        &mut seq,
        &[
            vertex_block(graph, "a", 0x1111, 1),
            vertex_block(graph, "b", 0x1234, 2),
            vertex_block(graph, "c", 0x3333, 3),
        ],
    )?;
    stream.extend(framed(&mut seq, &[vertex_block(graph, "d", 0x4444, 4)])?);

    let mut rank_line = Vec::new();
    Operator::set_rank(0x1234).encode(&mut rank_line);
    let at = find(&stream, &rank_line) + rank_line.len() - 2;
    assert_eq!(stream[at], b'4');
    stream[at] ^= 0x01;

    let parser = replay(&ctx, &stream)?;
    let stats = parser.stats();
    assert_eq!(stats.crc_mismatches, 1);
    assert_eq!(stats.permanent_errors, 1);
    assert_eq!(stats.syntax_errors, 0);
    let store = ctx.store();
    assert_eq!(store.order(), 3);
    assert!(store.contains(ObjectId::from_name("a")));
    assert!(!store.contains(ObjectId::from_name("b")));
    assert_eq!(store.vertex(ObjectId::from_name("c")).map(|v| v.rank), Some(0x3333));
    assert_eq!(store.vertex(ObjectId::from_name("d")).map(|v| v.rank), Some(0x4444));
    assert_eq!(ctx.writable_count(), 0);
    Ok(())
}

#[test]
fn damaged_transaction_comment_only_fails_the_envelope() -> Result<()> {
    let ctx = GraphContext::new("replica");
    let graph = ctx.obid();
    let mut seq = SerialSequence::starting_at(200, 9);
    let mut stream = framed(
        &mut seq,
        &[vertex_block(graph, "x", 1, 1), vertex_block(graph, "y", 2, 2)],
    )?;
    let at = find(&stream, b"[sn=") + 1;
    stream[at] ^= 0x01;

    let parser = replay(&ctx, &stream)?;
    let stats = parser.stats();
    assert_eq!(stats.crc_mismatches, 1);
    assert_eq!(stats.permanent_errors, 0);
    assert_eq!(stats.transactions, 1);
    assert_eq!(ctx.store().order(), 2);
    Ok(())
}

#[test]
fn truncated_stream_resumes_when_the_rest_arrives() -> Result<()> {
    let ctx = GraphContext::new("replica");
    let graph = ctx.obid();
    let mut seq = SerialSequence::starting_at(300, 11);
    let stream = framed(
        &mut seq,
        &[vertex_block(graph, "p", 5, 1), vertex_block(graph, "q", 6, 2)],
    )?;
    let cut = find(&stream, b"ENDOP") + 3;

    let mut parser = OperationParser::new(ParserOptions::default());
    let mut target = GraphExecutor::new(std::sync::Arc::clone(&ctx));
    let mut input = OperationBuffer::with_capacity_order(8, "input");
    input.write(&stream[..cut])?;
    assert_eq!(parser.feed(&mut input, &mut target), FeedOutcome::Drained);
    assert_eq!(ctx.store().order(), 0);
    assert!(parser.in_transaction());

    input.write(&stream[cut..])?;
    assert_eq!(parser.feed(&mut input, &mut target), FeedOutcome::Drained);
    assert_eq!(ctx.store().order(), 2);
    assert!(!parser.in_transaction());
    assert_eq!(parser.stats().crc_mismatches, 0);
    assert_eq!(parser.last_serial(), 301);
    Ok(())
}
