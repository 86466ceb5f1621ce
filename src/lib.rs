//! # courier
//!
//! Durable task queue and concurrency-bounded scheduler. Producers enqueue
//! opaque work items into a single lock-serialized JSON store; the scheduler
//! polls it, dispatches tasks to a pluggable [`TaskProcessor`] under a
//! cooperative per-task timeout, retries failures with a bounded budget, and
//! hands terminal tasks to a [`Reporter`].
//!
//! [`TaskProcessor`]: processor::TaskProcessor
//! [`Reporter`]: reporter::Reporter

pub mod config;
pub mod error;
pub mod model;
pub mod processor;
pub mod reporter;
pub mod scheduler;
pub mod store;
