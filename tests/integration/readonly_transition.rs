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
use sombra_durable::{Result, SombraError};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn origin() -> Result<Arc<GraphContext>> {
    let ctx = GraphContext::with_options(
        "origin",
        ContextOptions::default(),
        ProducerOptions {
            reconnect_min: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
            ..ProducerOptions::default()
        },
    );
    ctx.start_capture(EmitterOptions {
        commit_age: Duration::from_millis(10),
        ..EmitterOptions::default()
    })?;
    Ok(ctx)
}

fn replica() -> Arc<GraphContext> {
    GraphContext::with_options(
        "replica",
        ContextOptions {
            lock_timeout: Duration::from_millis(200),
            ..ContextOptions::default()
        },
        ProducerOptions::default(),
    )
}

fn add_people(ctx: &GraphContext, range: std::ops::Range<usize>) -> Result<()> {
    for i in range {
        let mut person = ctx.create_vertex(&format!("person-{i}"), VertexType::VERTEX)?;
        person.set_rank(i as u64)?;
        person.close()?;
    }
    if let Some(emitter) = ctx.emitter() {
        emitter.flush(TIMEOUT)?;
    }
    Ok(())
}

fn converge(origin: &GraphContext, replica: &GraphContext, service: &TransactionalConsumerService) -> Result<()> {
    origin.producers().wait_settled(TIMEOUT)?;
    service.wait_idle(TIMEOUT)?;
    wait_for("convergence", || {
        replica.store().fingerprint() == origin.store().fingerprint()
    });
    Ok(())
}

#[test]
fn readonly_replica_holds_back_replication_until_cleared() -> Result<()> {
    let replica = replica();
    let service = TransactionalConsumerService::bind(
        Arc::clone(&replica),
        ConsumerOptions {
            poll_interval: Duration::from_millis(1),
            ..ConsumerOptions::default()
        },
    )?;
    let origin = origin()?;
    let uri = format!("tcp://{}", service.local_addr());
    let id = origin.attach_subscriber(&[uri], AttachMode::Normal, Some(TIMEOUT))?;

    add_people(&origin, 0..3)?;
    converge(&origin, &replica, &service)?;

    assert_eq!(replica.set_readonly(Some(Duration::from_secs(5)), false)?, 1);
    assert!(replica.is_readonly());
    assert!(service.is_execution_suspended());

    // Local writers are turned away while the graph is readonly.
    match replica.create_vertex("local", VertexType::VERTEX) {
        Err(SombraError::Readonly) => {}
        other => panic!("expected a readonly refusal, got {:?}", other.map(|_| ())),
    }

    add_people(&origin, 3..6)?;
    wait_for("producer suspension", || {
        origin.producers().get(id).is_some_and(|p| p.suspends >= 1)
    });
    thread::sleep(Duration::from_millis(100));
    assert_eq!(replica.store().order(), 3);

    replica.clear_readonly()?;
    assert!(!replica.is_readonly());
    wait_for("execution resume", || !service.is_execution_suspended());
    converge(&origin, &replica, &service)?;
    assert_eq!(replica.store().order(), 6);
    let producer = origin.producers().get(id).expect("producer listed");
    assert_eq!(producer.accepted, producer.committed);

    origin.shutdown();
    service.shutdown();
    Ok(())
}

#[test]
fn durable_replica_keeps_logging_while_readonly() -> Result<()> {
    let dir = tempdir()?;
    let replica = replica();
    let service = TransactionalConsumerService::bind(
        Arc::clone(&replica),
        ConsumerOptions {
            durable: Some(dir.path().to_path_buf()),
            poll_interval: Duration::from_millis(1),
            ..ConsumerOptions::default()
        },
    )?;
    let origin = origin()?;
    let uri = format!("tcp://{}", service.local_addr());
    let id = origin.attach_subscriber(&[uri], AttachMode::Normal, Some(TIMEOUT))?;

    replica.set_readonly(Some(Duration::from_secs(5)), false)?;
    assert!(service.is_execution_suspended());

    add_people(&origin, 0..4)?;
    // The log acknowledges what the graph cannot yet execute.
    origin.producers().wait_settled(TIMEOUT)?;
    let producer = origin.producers().get(id).expect("producer listed");
    assert_eq!(service.durability().serial(), producer.last_serial);
    wait_for("backlog", || service.stats().backlog_transactions >= 1);
    assert_eq!(replica.store().order(), 0);

    replica.clear_readonly()?;
    converge(&origin, &replica, &service)?;
    assert_eq!(replica.store().order(), 4);
    wait_for("drained backlog", || service.stats().backlog_transactions == 0);

    origin.shutdown();
    service.shutdown();
    Ok(())
}
