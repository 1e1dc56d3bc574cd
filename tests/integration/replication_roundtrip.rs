#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sombra_durable::graph::{ContextOptions, GraphContext};
use sombra_durable::operation::EmitterOptions;
use sombra_durable::primitives::concurrency::VertexType;
use sombra_durable::replication::{
    AttachMode, ConsumerOptions, ProducerOptions, TransactionalConsumerService,
};
use sombra_durable::{ObjectId, Result};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn producer_options() -> ProducerOptions {
    ProducerOptions {
        reconnect_min: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(100),
        poll_interval: Duration::from_millis(1),
        ..ProducerOptions::default()
    }
}

fn consumer_options() -> ConsumerOptions {
    ConsumerOptions {
        poll_interval: Duration::from_millis(1),
        ..ConsumerOptions::default()
    }
}

fn emitter_options() -> EmitterOptions {
    EmitterOptions {
        commit_age: Duration::from_millis(10),
        ..EmitterOptions::default()
    }
}

fn source() -> Result<Arc<GraphContext>> {
    let ctx = GraphContext::with_options("origin", ContextOptions::default(), producer_options());
    ctx.start_capture(emitter_options())?;
    Ok(ctx)
}

/// Builds a small social graph: people with names, a follow chain and one removal.
fn populate(ctx: &GraphContext, people: usize) -> Result<()> {
    for i in 0..people {
        let mut person = ctx.create_vertex(&format!("person-{i}"), VertexType::VERTEX)?;
        person.set_property(1, &format!("name {i}"))?;
        person.set_rank(i as u64 * 10)?;
        person.close()?;
    }
    for i in 1..people {
        let mut tail = ctx.open_vertex(ObjectId::from_name(&format!("person-{i}")), None)?;
        tail.connect(7, ObjectId::from_name(&format!("person-{}", i - 1)))?;
        tail.close()?;
    }
    let last = ObjectId::from_name(&format!("person-{}", people - 1));
    let mut writer = ctx.open_vertex(last, None)?;
    writer.delete_outarcs()?;
    writer.delete_property(1)?;
    writer.close()?;
    Ok(())
}

fn settle(origin: &GraphContext, replica: &GraphContext, service: &TransactionalConsumerService) -> Result<()> {
    if let Some(emitter) = origin.emitter() {
        emitter.flush(TIMEOUT)?;
    }
    origin.producers().wait_settled(TIMEOUT)?;
    service.wait_idle(TIMEOUT)?;
    let deadline = Instant::now() + TIMEOUT;
    while replica.store().fingerprint() != origin.store().fingerprint() {
        assert!(Instant::now() < deadline, "replica never converged");
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

#[test]
fn graph_mutations_reach_the_replica() -> Result<()> {
    let replica = GraphContext::new("replica");
    let service = TransactionalConsumerService::bind(Arc::clone(&replica), consumer_options())?;
    let origin = source()?;
    let uri = format!("tcp://{}", service.local_addr());
    let id = origin.attach_subscriber(&[uri], AttachMode::Normal, Some(TIMEOUT))?;

    populate(&origin, 12)?;
    settle(&origin, &replica, &service)?;

    assert_eq!(replica.store().order(), 12);
    assert_eq!(replica.store().size(), 10);
    let stats = service.stats();
    assert!(stats.attached);
    assert!(stats.transactions >= 1);
    assert_eq!(stats.rejected, 0);
    let producer = origin.producers().get(id).expect("producer listed");
    assert_eq!(producer.accepted, producer.committed);
    assert_eq!(service.durability().serial(), producer.last_serial);

    origin.shutdown();
    service.shutdown();
    Ok(())
}

#[test]
fn durable_replica_restarts_from_its_log() -> Result<()> {
    let dir = tempdir()?;
    let durable = ConsumerOptions {
        durable: Some(dir.path().to_path_buf()),
        ..consumer_options()
    };
    let origin = source()?;
    let first = GraphContext::new("replica");
    let service = TransactionalConsumerService::bind(Arc::clone(&first), durable.clone())?;
    let uri = format!("tcp://{}", service.local_addr());
    origin.attach_subscriber(&[uri], AttachMode::Normal, Some(TIMEOUT))?;
    populate(&origin, 6)?;
    settle(&origin, &first, &service)?;
    let position = service.durability().get();
    assert!(position.serial > 0);
    origin.shutdown();
    service.shutdown();

    let restarted = GraphContext::new("replica");
    let service = TransactionalConsumerService::bind(
        Arc::clone(&restarted),
        ConsumerOptions {
            replay_log: true,
            ..durable
        },
    )?;
    assert_eq!(service.durability().get(), position);
    service.wait_idle(TIMEOUT)?;
    let deadline = Instant::now() + TIMEOUT;
    while restarted.store().fingerprint() != first.store().fingerprint() {
        assert!(Instant::now() < deadline, "log replay never converged");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(restarted.store().order(), 6);
    service.shutdown();
    Ok(())
}
