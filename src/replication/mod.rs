//! Transactional replication between graphs.
//!
//! A graph's emitter hands committed op blocks to its
//! [`TransactionalProducers`]; each producer frames them into transactions
//! and streams them to a [`TransactionalConsumerService`] on another graph,
//! which verifies, acknowledges and replays them and tracks how far it got
//! in a [`DurabilityPoint`].

/// Request and response lines of the replication protocol.
pub mod protocol;

/// Transaction envelopes and serial allocation.
pub mod transaction;

/// Last durably applied transaction on a consumer.
pub mod durability;

/// A single outbound subscriber stream.
pub mod producer;

/// The graph's collection of producers and their exchange threads.
pub mod producers;

/// Inbound service replaying a producer's transactions.
pub mod consumer;

pub use consumer::{ConsumerOptions, ConsumerStats, TransactionalConsumerService};
pub use durability::{DurabilityPoint, DurablePosition};
pub use producer::{
    AttachMode, Endpoint, ProducerFlags, ProducerId, ProducerOptions, ProducerStats, SubscriberInfo,
    TransactionalProducer,
};
pub use producers::TransactionalProducers;
pub use protocol::{RejectReason, Request, Response, SuspendCode, SuspendReason};
pub use transaction::{write_transaction, OperationTransaction, SerialSequence};
