use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::stream::{
    config::{OffsetReset, RetryPolicy},
    error::{Error, Result},
    offsets::{CommitPoint, Fence, OffsetStore},
    types::{Offset, TopicPartition, Watermarks},
};

#[derive(Debug, Default)]
struct PartitionProgress {
    committed: Option<Offset>,
    /// Highest offset below which every delivered record is processed
    ready: Option<Offset>,
    /// Delivered offsets above `ready`, flagged once processed
    pending: BTreeMap<Offset, bool>,
}

impl PartitionProgress {
    fn starting_at(committed: Option<Offset>) -> Self {
        Self {
            committed,
            ready: committed,
            pending: BTreeMap::new(),
        }
    }

    fn is_settled(&self, offset: Offset) -> bool {
        self.ready.is_some_and(|ready| offset <= ready)
    }

    fn advance(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if !*entry.get() {
                break;
            }
            let (offset, _) = entry.remove_entry();
            self.ready = Some(offset);
        }
    }

    fn committable(&self) -> Option<Offset> {
        match (self.ready, self.committed) {
            (Some(ready), Some(committed)) if ready > committed => Some(ready),
            (Some(ready), None) => Some(ready),
            _ => None,
        }
    }
}

/// Per-partition processing progress and its durable commits
///
/// Offsets are registered as the broker delivers them and marked once their
/// record has been dealt with. Only the highest offset below which every
/// delivered record is processed gets committed, so a record is never
/// acknowledged before the ones in front of it. Offsets the broker never
/// delivered (compacted gaps) do not hold progress back.
///
/// Commits carry the [`Fence`] granted with the current assignment and never
/// move a partition backwards.
pub struct OffsetTracker {
    store: Arc<dyn OffsetStore>,
    group_id: String,
    reset: OffsetReset,
    retry: RetryPolicy,
    fence: Option<Fence>,
    partitions: BTreeMap<TopicPartition, PartitionProgress>,
}

impl OffsetTracker {
    pub fn new(
        store: Arc<dyn OffsetStore>,
        group_id: &str,
        reset: OffsetReset,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            group_id: group_id.to_string(),
            reset,
            retry,
            fence: None,
            partitions: BTreeMap::new(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Set the ownership proof used by subsequent commits
    pub fn set_fence(&mut self, fence: Fence) {
        self.fence = Some(fence);
    }

    pub fn fence(&self) -> Option<&Fence> {
        self.fence.as_ref()
    }

    /// Start tracking a newly assigned partition and return where to read from
    ///
    /// That is the last committed offset + 1, or the reset policy's position when
    /// nothing was committed. A committed position that retention already
    /// removed falls forward to the low watermark.
    pub async fn resume_from(&mut self, tp: &TopicPartition, watermarks: Watermarks) -> Result<Offset> {
        let committed = self.store.committed(&self.group_id, tp).await?;

        let start = match committed {
            Some(offset) => (offset + 1).max(watermarks.low),
            None => match self.reset {
                OffsetReset::Earliest => watermarks.low,
                OffsetReset::Latest => watermarks.high,
            },
        };

        self.partitions
            .insert(tp.clone(), PartitionProgress::starting_at(committed));
        debug!(partition = %tp, ?committed, start, "resuming partition");
        Ok(start)
    }

    /// Register an offset handed out by the broker
    pub fn record_delivered(&mut self, tp: &TopicPartition, offset: Offset) {
        if let Some(progress) = self.partitions.get_mut(tp) {
            if !progress.is_settled(offset) {
                progress.pending.entry(offset).or_insert(false);
            }
        }
    }

    /// Mark an offset as done: handled, skipped, or dead-lettered
    pub fn record_processed(&mut self, tp: &TopicPartition, offset: Offset) {
        let Some(progress) = self.partitions.get_mut(tp) else {
            debug!(partition = %tp, offset, "ignoring progress on unassigned partition");
            return;
        };
        if progress.is_settled(offset) {
            return;
        }

        progress.pending.insert(offset, true);
        progress.advance();
    }

    /// Forget delivered-but-unprocessed offsets from `offset` on, so they can be fetched again
    pub fn rewind(&mut self, tp: &TopicPartition, offset: Offset) {
        if let Some(progress) = self.partitions.get_mut(tp) {
            progress.pending.retain(|&pending, _| pending < offset);
        }
    }

    /// Offsets that would be written by the next commit
    pub fn committable(&self) -> CommitPoint {
        self.partitions
            .iter()
            .filter_map(|(tp, progress)| progress.committable().map(|offset| (tp.clone(), offset)))
            .collect()
    }

    pub fn has_uncommitted(&self) -> bool {
        self.partitions.values().any(|p| p.committable().is_some())
    }

    /// Persist the processed progress of every tracked partition
    ///
    /// Returns what was written, which is empty when nothing moved.
    ///
    /// # Errors
    ///
    /// * `Error::AssignmentLost` - the store rejected the fence; not retried
    /// * `Error::CommitFailure` - the retry budget ran out; the same offsets stay
    ///   committable for the next cycle
    pub async fn commit(&mut self) -> Result<CommitPoint> {
        let offsets = self.committable();
        self.commit_offsets(offsets).await
    }

    /// Persist progress for the given partitions only
    pub async fn commit_partitions(&mut self, partitions: &[TopicPartition]) -> Result<CommitPoint> {
        let offsets = self
            .committable()
            .into_iter()
            .filter(|(tp, _)| partitions.contains(tp))
            .collect();
        self.commit_offsets(offsets).await
    }

    async fn commit_offsets(&mut self, offsets: CommitPoint) -> Result<CommitPoint> {
        if offsets.is_empty() {
            return Ok(offsets);
        }

        let fence = self.fence.clone().ok_or_else(|| {
            Error::AssignmentLost("no generation has been granted to this member".to_string())
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.commit(&self.group_id, &fence, &offsets).await {
                Ok(()) => {
                    for (tp, offset) in &offsets {
                        if let Some(progress) = self.partitions.get_mut(tp) {
                            progress.committed = progress.committed.max(Some(*offset));
                        }
                    }
                    debug!(
                        group_id = %self.group_id,
                        generation = fence.generation,
                        partitions = offsets.len(),
                        "committed offsets"
                    );
                    return Ok(offsets);
                }
                Err(e @ Error::AssignmentLost(_)) => return Err(e),
                Err(e) if !e.is_retryable() || attempt >= self.retry.max_attempts => {
                    return Err(Error::CommitFailure {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        group_id = %self.group_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "offset commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Stop tracking partitions after their progress has been committed
    pub fn release(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.partitions.remove(tp);
        }
    }

    /// Drop partitions whose ownership is gone, discarding uncommitted progress
    pub fn abandon(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            if let Some(progress) = self.partitions.remove(tp) {
                if progress.committable().is_some() {
                    warn!(partition = %tp, "abandoning uncommitted progress");
                }
            }
        }
    }

    /// Drop every partition and the fence
    pub fn clear(&mut self) {
        self.partitions.clear();
        self.fence = None;
    }

    pub fn is_assigned(&self, tp: &TopicPartition) -> bool {
        self.partitions.contains_key(tp)
    }

    pub fn assigned(&self) -> Vec<TopicPartition> {
        self.partitions.keys().cloned().collect()
    }

    /// Last offset this tracker knows to be durably committed
    pub fn committed(&self, tp: &TopicPartition) -> Option<Offset> {
        self.partitions.get(tp).and_then(|p| p.committed)
    }

    /// Highest contiguous processed offset, committed or not
    pub fn processed(&self, tp: &TopicPartition) -> Option<Offset> {
        self.partitions.get(tp).and_then(|p| p.ready)
    }

    pub fn commit_point(&self) -> CommitPoint {
        self.partitions
            .iter()
            .filter_map(|(tp, p)| p.committed.map(|offset| (tp.clone(), offset)))
            .collect()
    }
}
