use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::stream::{
    broker::{BrokerClient, RebalanceEvent},
    error::{Error, Result},
    offsets::{CommitPoint, Fence, OffsetStore},
    types::{Generation, Headers, Offset, Partition, RawRecord, TopicPartition, Watermarks},
};

struct PartitionLog {
    records: Vec<RawRecord>,
    next_offset: Offset,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            next_offset: 0,
        }
    }

    fn watermarks(&self) -> Watermarks {
        Watermarks {
            low: self.records.first().map(|r| r.offset).unwrap_or(self.next_offset),
            high: self.next_offset,
        }
    }

    fn read_from(&self, offset: Offset, max: usize) -> &[RawRecord] {
        let start = self.records.partition_point(|r| r.offset < offset);
        let end = self.records.len().min(start.saturating_add(max));
        &self.records[start..end]
    }
}

struct MemberState {
    topic: String,
    owned: BTreeSet<TopicPartition>,
    events: VecDeque<RebalanceEvent>,
    awaiting_ack: bool,
    active: bool,
}

impl MemberState {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            owned: BTreeSet::new(),
            events: VecDeque::new(),
            awaiting_ack: false,
            active: true,
        }
    }
}

#[derive(Default)]
struct GroupState {
    generation: Generation,
    members: BTreeMap<String, MemberState>,
    committed: HashMap<TopicPartition, Offset>,
    target: Option<BTreeMap<String, Vec<TopicPartition>>>,
    failing_commits: u32,
}

impl GroupState {
    /// Start an eager rebalance: every owner gives up everything, then the
    /// new assignment is handed out once all revocations are acknowledged.
    fn rebalance(&mut self, partition_counts: &HashMap<String, Partition>) {
        let mut subscribers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, member) in self.members.iter().filter(|(_, m)| m.active) {
            subscribers
                .entry(member.topic.clone())
                .or_default()
                .push(id.clone());
        }

        let mut target: BTreeMap<String, Vec<TopicPartition>> = BTreeMap::new();
        for (topic, members) in &subscribers {
            let count = partition_counts.get(topic).copied().unwrap_or(0).max(0) as usize;
            for (member_id, range) in members.iter().zip(range_assign(count, members.len())) {
                let partitions = range
                    .map(|p| TopicPartition::new(topic.clone(), p as Partition))
                    .collect();
                target.insert(member_id.clone(), partitions);
            }
        }

        for member in self.members.values_mut().filter(|m| m.active) {
            if !member.owned.is_empty() && !member.awaiting_ack {
                member.events.push_back(RebalanceEvent::Revoked {
                    partitions: member.owned.iter().cloned().collect(),
                });
                member.awaiting_ack = true;
            }
        }

        self.target = Some(target);
        self.try_complete();
    }

    fn try_complete(&mut self) {
        if self.members.values().any(|m| m.active && m.awaiting_ack) {
            return;
        }
        let Some(target) = self.target.take() else {
            return;
        };

        self.generation += 1;
        for (id, member) in self.members.iter_mut().filter(|(_, m)| m.active) {
            let partitions = target.get(id).cloned().unwrap_or_default();
            member.owned = partitions.iter().cloned().collect();
            member.events.push_back(RebalanceEvent::Assigned {
                partitions,
                generation: self.generation,
            });
        }
        debug!(generation = self.generation, "group rebalance completed");
    }
}

/// Split `count` partitions into contiguous ranges, earlier members taking the remainder
fn range_assign(count: usize, members: usize) -> Vec<std::ops::Range<usize>> {
    if members == 0 {
        return Vec::new();
    }
    let per = count / members;
    let extra = count % members;
    (0..members)
        .map(|i| {
            let start = i * per + i.min(extra);
            let len = per + usize::from(i < extra);
            start..start + len
        })
        .collect()
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<PartitionLog>>,
    groups: HashMap<String, GroupState>,
}

impl BrokerState {
    fn partition_counts(&self) -> HashMap<String, Partition> {
        self.topics
            .iter()
            .map(|(name, parts)| (name.clone(), parts.len() as Partition))
            .collect()
    }

    fn log_mut(&mut self, topic: &str, partition: Partition) -> Result<&mut PartitionLog> {
        self.topics
            .get_mut(topic)
            .and_then(|parts| usize::try_from(partition).ok().and_then(|p| parts.get_mut(p)))
            .ok_or_else(|| Error::Broker(format!("unknown partition {}-{}", topic, partition)))
    }

    fn log(&self, tp: &TopicPartition) -> Result<&PartitionLog> {
        self.topics
            .get(&tp.topic)
            .and_then(|parts| usize::try_from(tp.partition).ok().and_then(|p| parts.get(p)))
            .ok_or_else(|| Error::Broker(format!("unknown partition {}", tp)))
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

fn lock(shared: &Shared) -> MutexGuard<'_, BrokerState> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process partitioned log with consumer group coordination
///
/// Implements the broker side the pipeline relies on: partitioned topics,
/// an eager rebalance protocol with revocation acknowledgement, group
/// generations, and fenced offset storage. Cloning shares the same broker.
///
/// # Example
///
/// ```
/// use consumer_pipeline::stream::broker::MemoryBroker;
///
/// let broker = MemoryBroker::new();
/// broker.create_topic("notifications", 2).unwrap();
/// let offset = broker.produce("notifications", 1, None, Some("hello".into())).unwrap();
/// assert_eq!(offset, 0);
/// ```
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a topic; groups already subscribed to it rebalance
    pub fn create_topic(&self, topic: &str, partitions: Partition) -> Result<()> {
        if partitions <= 0 {
            return Err(Error::Validation(format!(
                "topic {} needs at least one partition",
                topic
            )));
        }

        let mut state = lock(&self.shared);
        if state.topics.contains_key(topic) {
            return Err(Error::Validation(format!("topic {} already exists", topic)));
        }
        state
            .topics
            .insert(topic.to_string(), (0..partitions).map(|_| PartitionLog::new()).collect());

        let counts = state.partition_counts();
        for group in state.groups.values_mut() {
            if group.members.values().any(|m| m.active && m.topic == topic) {
                group.rebalance(&counts);
            }
        }
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Append a record; returns its offset
    pub fn produce(
        &self,
        topic: &str,
        partition: Partition,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<Offset> {
        self.produce_with_headers(topic, partition, key, value, Headers::new())
    }

    pub fn produce_with_headers(
        &self,
        topic: &str,
        partition: Partition,
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Headers,
    ) -> Result<Offset> {
        let mut state = lock(&self.shared);
        let log = state.log_mut(topic, partition)?;
        let offset = log.next_offset;
        log.records.push(RawRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            value,
            headers,
            timestamp: Some(Utc::now()),
        });
        log.next_offset += 1;
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(offset)
    }

    /// Partition a keyed record lands on
    pub fn partition_for_key(&self, topic: &str, key: &[u8]) -> Result<Partition> {
        let state = lock(&self.shared);
        let count = state
            .topics
            .get(topic)
            .map(|parts| parts.len() as u64)
            .ok_or_else(|| Error::Broker(format!("unknown topic {}", topic)))?;

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Ok((hasher.finish() % count) as Partition)
    }

    /// Leave a gap in a partition's offsets, as compaction would
    pub fn skip_offsets(&self, topic: &str, partition: Partition, count: Offset) -> Result<()> {
        let mut state = lock(&self.shared);
        state.log_mut(topic, partition)?.next_offset += count;
        Ok(())
    }

    /// A new group member with a generated id
    pub fn consumer(&self, group_id: &str) -> MemoryConsumer {
        self.consumer_with_id(group_id, format!("consumer-{}", Uuid::new_v4()))
    }

    /// A group member with a fixed id; ids order partition assignment
    pub fn consumer_with_id(&self, group_id: &str, member_id: impl Into<String>) -> MemoryConsumer {
        MemoryConsumer {
            shared: Arc::clone(&self.shared),
            group_id: group_id.to_string(),
            member_id: member_id.into(),
            positions: HashMap::new(),
            rotation: 0,
        }
    }

    /// Offset storage backed by the broker's group state
    pub fn offset_store(&self) -> MemoryOffsetStore {
        MemoryOffsetStore {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<Offset> {
        lock(&self.shared)
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(tp).copied())
    }

    pub fn generation(&self, group_id: &str) -> Generation {
        lock(&self.shared)
            .groups
            .get(group_id)
            .map(|g| g.generation)
            .unwrap_or(0)
    }

    /// Partitions currently owned by a member
    pub fn assignment(&self, group_id: &str, member_id: &str) -> Vec<TopicPartition> {
        lock(&self.shared)
            .groups
            .get(group_id)
            .and_then(|g| g.members.get(member_id))
            .map(|m| m.owned.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Expire a member's session: its partitions are lost and the rest of the group rebalances
    pub fn expire_member(&self, group_id: &str, member_id: &str) -> bool {
        let mut state = lock(&self.shared);
        let counts = state.partition_counts();
        let Some(group) = state.groups.get_mut(group_id) else {
            return false;
        };
        let Some(member) = group.members.get_mut(member_id).filter(|m| m.active) else {
            return false;
        };

        let lost: Vec<TopicPartition> = std::mem::take(&mut member.owned).into_iter().collect();
        member.active = false;
        member.awaiting_ack = false;
        member.events.push_back(RebalanceEvent::Lost { partitions: lost });
        info!(group_id, member_id, "member session expired");

        group.rebalance(&counts);
        drop(state);

        self.shared.notify.notify_waiters();
        true
    }

    /// Make the next `count` offset commits for a group fail transiently
    pub fn fail_next_commits(&self, group_id: &str, count: u32) {
        lock(&self.shared)
            .groups
            .entry(group_id.to_string())
            .or_default()
            .failing_commits = count;
    }
}

/// One member of a consumer group on a [`MemoryBroker`]
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    group_id: String,
    member_id: String,
    positions: HashMap<TopicPartition, Offset>,
    rotation: usize,
}

impl MemoryConsumer {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Returns the records read and whether a rebalance event is waiting
    fn fetch(&mut self, max_records: usize) -> (Vec<RawRecord>, bool) {
        let state = lock(&self.shared);
        let Some(member) = state
            .groups
            .get(&self.group_id)
            .and_then(|g| g.members.get(&self.member_id))
        else {
            return (Vec::new(), false);
        };

        if !member.events.is_empty() {
            return (Vec::new(), true);
        }

        let owned: Vec<&TopicPartition> = member.owned.iter().collect();
        let mut records = Vec::new();
        if owned.is_empty() {
            return (records, false);
        }

        self.rotation = self.rotation.wrapping_add(1);
        for i in 0..owned.len() {
            if records.len() >= max_records {
                break;
            }
            let tp = owned[(self.rotation + i) % owned.len()];
            let Some(&position) = self.positions.get(tp) else {
                continue;
            };
            let Ok(log) = state.log(tp) else {
                continue;
            };

            let batch = log.read_from(position, max_records - records.len());
            if let Some(last) = batch.last() {
                self.positions.insert(tp.clone(), last.offset + 1);
            }
            records.extend_from_slice(batch);
        }

        (records, false)
    }
}

#[async_trait]
impl BrokerClient for MemoryConsumer {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let mut state = lock(&self.shared);
        let counts = state.partition_counts();
        let group = state.groups.entry(self.group_id.clone()).or_default();

        let member = group
            .members
            .entry(self.member_id.clone())
            .or_insert_with(|| MemberState::new(topic));
        member.topic = topic.to_string();
        member.active = true;

        group.rebalance(&counts);
        drop(state);

        debug!(group_id = %self.group_id, member_id = %self.member_id, topic, "joined group");
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<RawRecord>> {
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);

        loop {
            // Register for wakeups before looking, so a produce in between is not missed
            let notified = shared.notify.notified();

            let (records, rebalance_pending) = self.fetch(max_records);
            if !records.is_empty() || rebalance_pending {
                return Ok(records);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    fn next_rebalance(&mut self) -> Option<RebalanceEvent> {
        let mut state = lock(&self.shared);
        let event = state
            .groups
            .get_mut(&self.group_id)
            .and_then(|g| g.members.get_mut(&self.member_id))
            .and_then(|m| m.events.pop_front())?;

        match &event {
            RebalanceEvent::Assigned { partitions, .. } => {
                self.positions.retain(|tp, _| partitions.contains(tp));
            }
            RebalanceEvent::Revoked { partitions } | RebalanceEvent::Lost { partitions } => {
                for tp in partitions {
                    self.positions.remove(tp);
                }
            }
        }

        Some(event)
    }

    async fn acknowledge_revocation(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        let mut state = lock(&self.shared);
        let group = state
            .groups
            .get_mut(&self.group_id)
            .ok_or_else(|| Error::Broker(format!("group {} does not exist", self.group_id)))?;

        if let Some(member) = group.members.get_mut(&self.member_id) {
            for tp in partitions {
                member.owned.remove(tp);
                self.positions.remove(tp);
            }
            member.awaiting_ack = false;
        }
        group.try_complete();
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn seek(&mut self, tp: &TopicPartition, offset: Offset) -> Result<()> {
        let state = lock(&self.shared);
        let owns = state
            .groups
            .get(&self.group_id)
            .and_then(|g| g.members.get(&self.member_id))
            .is_some_and(|m| m.active && m.owned.contains(tp));
        drop(state);

        if !owns {
            return Err(Error::AssignmentLost(format!(
                "{} is not owned by {}",
                tp, self.member_id
            )));
        }

        self.positions.insert(tp.clone(), offset);
        Ok(())
    }

    async fn watermarks(&mut self, tp: &TopicPartition) -> Result<Watermarks> {
        Ok(lock(&self.shared).log(tp)?.watermarks())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = lock(&self.shared);
        let counts = state.partition_counts();
        if let Some(group) = state.groups.get_mut(&self.group_id) {
            if group.members.remove(&self.member_id).is_some() {
                group.rebalance(&counts);
            }
        }
        drop(state);

        self.positions.clear();
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Group offset storage of a [`MemoryBroker`]
///
/// Commits are accepted only from active members, under the current
/// generation, for partitions they own.
#[derive(Clone)]
pub struct MemoryOffsetStore {
    shared: Arc<Shared>,
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn commit(&self, group_id: &str, fence: &Fence, offsets: &CommitPoint) -> Result<()> {
        let mut state = lock(&self.shared);
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| Error::AssignmentLost(format!("group {} has no members", group_id)))?;

        if group.failing_commits > 0 {
            group.failing_commits -= 1;
            return Err(Error::Broker("offset commit request timed out".to_string()));
        }

        let member = group
            .members
            .get(&fence.member_id)
            .filter(|m| m.active)
            .ok_or_else(|| {
                Error::AssignmentLost(format!(
                    "member {} is not part of group {}",
                    fence.member_id, group_id
                ))
            })?;

        if fence.generation != group.generation {
            return Err(Error::AssignmentLost(format!(
                "generation {} is stale, group {} is at {}",
                fence.generation, group_id, group.generation
            )));
        }

        if let Some(tp) = offsets.keys().find(|tp| !member.owned.contains(*tp)) {
            return Err(Error::AssignmentLost(format!(
                "{} is not owned by {}",
                tp, fence.member_id
            )));
        }

        for (tp, offset) in offsets {
            let committed = group.committed.entry(tp.clone()).or_insert(*offset);
            *committed = (*committed).max(*offset);
        }
        Ok(())
    }

    async fn committed(&self, group_id: &str, tp: &TopicPartition) -> Result<Option<Offset>> {
        Ok(lock(&self.shared)
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(tp).copied()))
    }
}
