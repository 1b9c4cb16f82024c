//! Message-consumption pipeline
//!
//! Connects to a broker as a member of a consumer group, decodes
//! schema-described records, dispatches each one to a single application
//! handler and commits progress durably.
//!
//! Data flows broker → [`codec::WireDecoder`] → [`Consumer`] →
//! [`consumer::HandlerRegistry`] → [`offsets::OffsetTracker`] → offset store.
//!
//! - [`broker`]: the `BrokerClient` seam and an in-process broker with group coordination
//! - [`codec`]: Avro wire framing, record keys, schema registries
//! - [`offsets`]: progress tracking and offset stores
//! - [`consumer`]: the dispatch loop, handler registry and error sinks
//! - [`postgres`]: PostgreSQL offset store

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod offsets;
pub mod postgres;
pub mod types;

pub use config::{ConsumerConfig, FailurePolicy, OffsetReset, RetryPolicy};
pub use consumer::{Consumer, ConsumerHandle, ConsumerStats, LoopState};
pub use error::{BoxError, Error, ErrorKind, Result};
pub use types::{DecodedEnvelope, Offset, Partition, RawRecord, TopicPartition};
