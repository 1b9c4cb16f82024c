//! Broker client seam
//!
//! The pipeline never speaks a broker's wire protocol itself. Everything it
//! needs from the broker - fetching, seeking, group membership and rebalance
//! notifications - goes through [`BrokerClient`]. [`MemoryBroker`] is a
//! complete in-process implementation with an eager-rebalance group
//! coordinator, used by the tests and the demo binary.

pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::stream::{
    error::Result,
    types::{Generation, Offset, RawRecord, TopicPartition, Watermarks},
};

pub use memory::{MemoryBroker, MemoryConsumer, MemoryOffsetStore};

/// Partition ownership changes announced by the group coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// The member now owns exactly these partitions under `generation`
    Assigned {
        partitions: Vec<TopicPartition>,
        generation: Generation,
    },

    /// The member must stop processing these partitions and acknowledge
    ///
    /// Ownership lasts until the acknowledgement, so progress may still be
    /// committed for them.
    Revoked { partitions: Vec<TopicPartition> },

    /// Ownership is already gone (session expired, fenced); nothing may be committed
    Lost { partitions: Vec<TopicPartition> },
}

/// Consumer-side view of a broker
#[async_trait]
pub trait BrokerClient: Send {
    /// Identity of this member within its consumer group
    fn member_id(&self) -> &str;

    /// Join the group for `topic`; partitions arrive later as a rebalance event
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Fetch up to `max_records` from owned partitions
    ///
    /// Blocks up to `timeout` when nothing is available. Returns early, possibly
    /// empty, when a rebalance event is waiting.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<RawRecord>>;

    /// Take the next pending rebalance event without blocking
    fn next_rebalance(&mut self) -> Option<RebalanceEvent>;

    /// Confirm the given partitions are no longer being processed
    async fn acknowledge_revocation(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Set the fetch position of an owned partition
    async fn seek(&mut self, tp: &TopicPartition, offset: Offset) -> Result<()>;

    async fn watermarks(&mut self, tp: &TopicPartition) -> Result<Watermarks>;

    /// Leave the group
    async fn close(&mut self) -> Result<()>;
}
