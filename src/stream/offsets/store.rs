use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::stream::{
    error::Result,
    types::{Generation, Offset, TopicPartition},
};

/// Committed offset per partition
///
/// Each value is the last offset processed, so consumption resumes at value + 1.
pub type CommitPoint = BTreeMap<TopicPartition, Offset>;

/// Proof of ownership attached to every commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fence {
    pub member_id: String,
    pub generation: Generation,
}

impl Fence {
    pub fn new(member_id: impl Into<String>, generation: Generation) -> Self {
        Self {
            member_id: member_id.into(),
            generation,
        }
    }
}

/// Durable storage of consumer group progress
///
/// Implementations must keep commits monotonic per partition and reject
/// commits carrying a stale fence with `Error::AssignmentLost`.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn commit(&self, group_id: &str, fence: &Fence, offsets: &CommitPoint) -> Result<()>;

    /// Last committed offset for a partition, if any
    async fn committed(&self, group_id: &str, tp: &TopicPartition) -> Result<Option<Offset>>;
}
