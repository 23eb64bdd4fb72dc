//! Broker transports and the delayed-delivery queue.
//!
//! Two backends implement the [`Broker`] trait from `taskq-core`: a
//! NATS JetStream transport for production and an in-process
//! in-memory broker for embedded runs and tests. Both provide
//! persistent streams, durable consumers, at-least-once delivery and
//! bounded publish buffering.

pub mod delayed;
pub mod factory;
pub mod in_memory;
pub mod nats;
pub mod producer;

pub use delayed::DelayedTaskQueue;
pub use factory::BrokerFactory;
pub use in_memory::InMemoryBroker;
pub use nats::NatsBroker;
pub use producer::TaskProducer;

pub use taskq_core::traits::broker::Broker;
