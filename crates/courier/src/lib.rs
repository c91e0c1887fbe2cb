//! Courier — event delivery pipeline for multi-channel assistant runtimes.
//!
//! Ingestion publishes normalized [`event::Event`]s through
//! [`publisher::EventPublisher`]; the configured [`queue::QueueBackend`]
//! partitions them by conversation and the consumer groups bursts into
//! [`event::DeliveryUnit`]s; [`worker::ExecutionWorker`] runs the processing
//! layer with a typing watchdog and routes results through
//! [`egress::EgressRouter`] to the registered channel senders.

pub mod config;
pub mod egress;
pub mod event;
pub mod handlers;
pub mod publisher;
pub mod queue;
pub mod response;
pub mod server;
pub mod watchdog;
pub mod worker;
