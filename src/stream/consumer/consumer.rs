use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::stream::{
    broker::{BrokerClient, RebalanceEvent},
    codec::{RecordKey, WireDecoder},
    config::{ConsumerConfig, FailurePolicy},
    consumer::{
        ConsumerHandle, DeadLetter, Disposition, ErrorEvent, ErrorSink, HandlerRegistry,
        HandlerResult, LoopState, TracingErrorSink,
    },
    error::{Error, Result},
    offsets::{CommitPoint, Fence, OffsetStore, OffsetTracker},
    types::{DecodedEnvelope, Offset, RawRecord, TopicPartition},
};

/// Counters kept by a consumer over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub polls: u64,
    pub records_received: u64,
    pub records_handled: u64,
    pub records_skipped: u64,
    pub dead_lettered: u64,
    pub handler_retries: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub rebalances: u64,
}

enum RecordOutcome {
    /// The offset may be committed
    Settled,
    /// Fetch the partition again from this record
    Rewind,
}

/// Dispatch loop for one member of a consumer group
///
/// Polls batches from the broker, decodes each record, hands it to the
/// registered handler and commits progress after every batch:
///
/// 1. **Poll**: fetch up to `max_batch_size` records from owned partitions
/// 2. **Decode**: undecodable records are dead-lettered and skipped
/// 3. **Dispatch**: records of one partition go to the handler one at a time, in offset order
/// 4. **Track**: an offset becomes committable only once its record is dealt with
/// 5. **Commit**: processed progress is persisted, fenced by the group generation
///
/// Rebalance events are applied before each poll and between records, never
/// while a handler runs. Revoked partitions have their progress committed
/// before the revocation is acknowledged; lost partitions are dropped without
/// a commit. Delivery is at-least-once: a crash between handling and commit
/// replays the uncommitted records.
///
/// # Example
///
/// ```no_run
/// use consumer_pipeline::models::Notification;
/// use consumer_pipeline::stream::broker::MemoryBroker;
/// use consumer_pipeline::stream::codec::{MemorySchemaRegistry, SchemaCache, WireDecoder};
/// use consumer_pipeline::stream::{Consumer, ConsumerConfig};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let broker = MemoryBroker::new();
///     broker.create_topic("notifications", 2)?;
///
///     let registry = Arc::new(MemorySchemaRegistry::new());
///     let cache = Arc::new(SchemaCache::new(registry));
///     let decoder = WireDecoder::<i64, Notification>::new(cache, Notification::schema()?);
///
///     let config = ConsumerConfig::new("notifications", "notification-group");
///     let mut consumer = Consumer::new(
///         broker.consumer("notification-group"),
///         config,
///         decoder,
///         Arc::new(broker.offset_store()),
///     )?;
///
///     consumer.on_record(|envelope| async move {
///         println!("received key = '{:?}' with payload='{}'", envelope.key(), envelope.value());
///         Ok(())
///     })?;
///
///     let handle = consumer.handle();
///     tokio::spawn(async move {
///         tokio::signal::ctrl_c().await.ok();
///         handle.shutdown();
///     });
///
///     let stats = consumer.run().await?;
///     println!("handled {} record(s)", stats.records_handled);
///     Ok(())
/// }
/// ```
pub struct Consumer<B, K, V> {
    broker: B,
    config: ConsumerConfig,
    decoder: WireDecoder<K, V>,
    tracker: OffsetTracker,
    handlers: HandlerRegistry<K, V>,
    sink: Arc<dyn ErrorSink>,
    state: watch::Sender<LoopState>,
    shutdown: Arc<watch::Sender<bool>>,
    /// Assigned partitions whose start position is not known yet
    unresumed: BTreeSet<TopicPartition>,
    rejoin: bool,
    stats: ConsumerStats,
}

impl<B, K, V> Consumer<B, K, V>
where
    B: BrokerClient,
    K: RecordKey,
    V: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create a consumer; nothing touches the network until [`Consumer::start`]
    ///
    /// # Errors
    ///
    /// `Error::Validation` when the configuration is invalid.
    pub fn new(
        broker: B,
        config: ConsumerConfig,
        decoder: WireDecoder<K, V>,
        offset_store: Arc<dyn OffsetStore>,
    ) -> Result<Self> {
        config.validate()?;

        let tracker = OffsetTracker::new(
            offset_store,
            &config.group_id,
            config.offset_reset,
            config.commit_retry,
        );
        let (state, _) = watch::channel(LoopState::Stopped);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            broker,
            config,
            decoder,
            tracker,
            handlers: HandlerRegistry::new(),
            sink: Arc::new(TracingErrorSink),
            state,
            shutdown: Arc::new(shutdown),
            unresumed: BTreeSet::new(),
            rejoin: false,
            stats: ConsumerStats::default(),
        })
    }

    /// Replace the default `tracing` error sink (builder pattern)
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Register the record handler; only one may be registered
    pub fn on_record<F, Fut>(&mut self, handler: F) -> Result<()>
    where
        F: Fn(DecodedEnvelope<K, V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(handler)
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle::new(self.state.subscribe(), Arc::clone(&self.shutdown))
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn tracker(&self) -> &OffsetTracker {
        &self.tracker
    }

    pub fn member_id(&self) -> &str {
        self.broker.member_id()
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn transition(&self, next: LoopState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "unexpected consumer state change");
        }
        self.state.send_replace(next);
        debug!(member_id = %self.broker.member_id(), from = %current, to = %next, "consumer state changed");
    }

    /// Join the group and wait for the first assignment
    ///
    /// # Errors
    ///
    /// Startup failures end here: no handler registered, schema registry
    /// unreachable, or the subscription rejected. The consumer is left stopped.
    pub async fn start(&mut self) -> Result<()> {
        if !self.handlers.is_registered() {
            return Err(Error::Validation(
                "cannot start without a record handler".to_string(),
            ));
        }
        if self.state() != LoopState::Stopped {
            return Err(Error::Validation("consumer is already started".to_string()));
        }

        self.transition(LoopState::Starting);
        if let Err(e) = self.join().await {
            error!(topic = %self.config.topic, error = %e, "consumer failed to start");
            self.transition(LoopState::Stopped);
            return Err(e);
        }

        self.transition(LoopState::Running);
        info!(
            member_id = %self.broker.member_id(),
            group_id = %self.config.group_id,
            topic = %self.config.topic,
            partitions = self.tracker.assigned().len(),
            "consumer started"
        );
        Ok(())
    }

    async fn join(&mut self) -> Result<()> {
        self.decoder.cache().check_connection().await?;
        self.broker.subscribe(&self.config.topic).await?;

        while self.tracker.fence().is_none() && !self.shutdown_requested() {
            // Nothing is owned yet, so this only waits for the coordinator
            self.broker
                .poll(self.config.max_batch_size, self.config.poll_timeout())
                .await?;
            self.process_rebalances().await;
        }
        Ok(())
    }

    /// Start, then poll until shutdown is requested through a [`ConsumerHandle`]
    ///
    /// Returns the final counters once the consumer has left the group.
    pub async fn run(mut self) -> Result<ConsumerStats> {
        self.start().await?;

        while !self.shutdown_requested() {
            self.poll_once().await?;
        }

        self.shutdown().await
    }

    /// Run one poll → decode → dispatch → commit cycle
    ///
    /// Returns true if records were fetched, false if the poll came back empty.
    pub async fn poll_once(&mut self) -> Result<bool> {
        if !matches!(self.state(), LoopState::Running | LoopState::Rebalancing) {
            return Err(Error::Validation("consumer is not running".to_string()));
        }

        let mut stale: HashSet<TopicPartition> = self.process_rebalances().await;
        self.resume_partitions().await;

        let records = match self
            .broker
            .poll(self.config.max_batch_size, self.config.poll_timeout())
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(topic = %self.config.topic, error = %e, "poll failed");
                time::sleep(self.config.poll_timeout()).await;
                return Ok(false);
            }
        };
        self.stats.polls += 1;
        let had_records = !records.is_empty();

        for record in &records {
            self.tracker
                .record_delivered(&record.topic_partition(), record.offset);
        }

        let mut halted: HashSet<TopicPartition> = HashSet::new();
        for record in records {
            stale.extend(self.process_rebalances().await);

            let tp = record.topic_partition();
            if stale.contains(&tp) || halted.contains(&tp) || !self.tracker.is_assigned(&tp) {
                continue;
            }

            let offset = record.offset;
            self.stats.records_received += 1;
            if let RecordOutcome::Rewind = self.process_record(record).await {
                halted.insert(tp.clone());
                self.rewind(&tp, offset).await;
            }
        }

        if self.tracker.has_uncommitted() {
            self.commit_cycle().await;
        }

        if !halted.is_empty() {
            // Give an unreachable registry a moment before fetching again
            time::sleep(self.config.poll_timeout()).await;
        }

        Ok(had_records)
    }

    async fn process_record(&mut self, record: RawRecord) -> RecordOutcome {
        let tp = record.topic_partition();
        let offset = record.offset;

        let envelope = match self.decoder.decode(record.clone()).await {
            Ok(envelope) => envelope,
            Err(e @ Error::SchemaRegistry(_)) => {
                self.report(&e, &tp, Some(offset), 1, Disposition::Retrying);
                return RecordOutcome::Rewind;
            }
            Err(e) => {
                self.dead_letter(record, &e, 1);
                self.tracker.record_processed(&tp, offset);
                return RecordOutcome::Settled;
            }
        };

        let policy = self.config.failure_policy;
        let max_attempts = match policy {
            FailurePolicy::SkipAndLog => 1,
            FailurePolicy::HaltAndRetry(retry) => retry.max_attempts.max(1),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result =
                invoke_with_timeout(&self.handlers, self.config.handler_timeout(), envelope.clone())
                    .await;

            let e = match result {
                Ok(()) => {
                    self.stats.records_handled += 1;
                    self.tracker.record_processed(&tp, offset);
                    return RecordOutcome::Settled;
                }
                Err(e) => e,
            };

            match policy {
                FailurePolicy::SkipAndLog => {
                    self.report(&e, &tp, Some(offset), attempt, Disposition::Skipped);
                    self.stats.records_skipped += 1;
                    self.tracker.record_processed(&tp, offset);
                    return RecordOutcome::Settled;
                }
                FailurePolicy::HaltAndRetry(retry) if attempt < max_attempts => {
                    self.report(&e, &tp, Some(offset), attempt, Disposition::Retrying);
                    self.stats.handler_retries += 1;
                    time::sleep(retry.backoff(attempt)).await;
                }
                FailurePolicy::HaltAndRetry(_) => {
                    self.dead_letter(envelope.raw().clone(), &e, attempt);
                    self.tracker.record_processed(&tp, offset);
                    return RecordOutcome::Settled;
                }
            }
        }
    }

    async fn rewind(&mut self, tp: &TopicPartition, offset: Offset) {
        self.tracker.rewind(tp, offset);
        if let Err(e) = self.broker.seek(tp, offset).await {
            warn!(partition = %tp, offset, error = %e, "could not rewind partition");
        }
    }

    /// Apply every pending rebalance event; returns partitions taken away
    async fn process_rebalances(&mut self) -> HashSet<TopicPartition> {
        let mut removed = HashSet::new();

        while let Some(event) = self.broker.next_rebalance() {
            if self.state() == LoopState::Running {
                self.transition(LoopState::Rebalancing);
            }
            self.stats.rebalances += 1;
            removed.extend(self.apply_rebalance(event).await);
        }

        if self.rejoin {
            match self.broker.subscribe(&self.config.topic).await {
                Ok(()) => self.rejoin = false,
                Err(e) => warn!(topic = %self.config.topic, error = %e, "rejoining group failed"),
            }
        }

        if self.state() == LoopState::Rebalancing {
            self.transition(LoopState::Running);
        }
        removed
    }

    async fn apply_rebalance(&mut self, event: RebalanceEvent) -> Vec<TopicPartition> {
        match event {
            RebalanceEvent::Assigned {
                partitions,
                generation,
            } => {
                info!(
                    member_id = %self.broker.member_id(),
                    generation,
                    partitions = ?partitions,
                    "partitions assigned"
                );
                // The new set is complete; anything tracked outside it is no longer owned
                let dropped: Vec<TopicPartition> = self
                    .tracker
                    .assigned()
                    .into_iter()
                    .filter(|tp| !partitions.contains(tp))
                    .collect();
                self.tracker.abandon(&dropped);

                self.tracker
                    .set_fence(Fence::new(self.broker.member_id(), generation));
                self.unresumed = partitions.into_iter().collect();
                self.resume_partitions().await;
                dropped
            }
            RebalanceEvent::Revoked { partitions } => {
                info!(member_id = %self.broker.member_id(), partitions = ?partitions, "partitions revoked");
                self.commit_partitions(&partitions).await;
                self.tracker.release(&partitions);
                for tp in &partitions {
                    self.unresumed.remove(tp);
                }
                if let Err(e) = self.broker.acknowledge_revocation(&partitions).await {
                    warn!(error = %e, "could not acknowledge revocation");
                }
                partitions
            }
            RebalanceEvent::Lost { partitions } => {
                let err = Error::AssignmentLost(format!(
                    "member {} lost its partitions",
                    self.broker.member_id()
                ));
                for tp in &partitions {
                    let processed = self.tracker.processed(tp);
                    self.report(&err, tp, processed, 1, Disposition::Abandoned);
                    self.unresumed.remove(tp);
                }
                self.tracker.abandon(&partitions);
                self.rejoin = true;
                partitions
            }
        }
    }

    /// Seek assigned partitions to their resume position
    ///
    /// Partitions whose position could not be determined are retried on the next cycle.
    async fn resume_partitions(&mut self) {
        let pending = std::mem::take(&mut self.unresumed);

        for tp in pending {
            let result = async {
                let watermarks = self.broker.watermarks(&tp).await?;
                let start = self.tracker.resume_from(&tp, watermarks).await?;
                self.broker.seek(&tp, start).await?;
                Ok::<_, Error>(start)
            }
            .await;

            match result {
                Ok(start) => debug!(partition = %tp, start, "partition positioned"),
                Err(e @ Error::AssignmentLost(_)) => {
                    self.tracker.abandon(std::slice::from_ref(&tp));
                    self.report(&e, &tp, None, 1, Disposition::Abandoned);
                }
                Err(e) => {
                    warn!(partition = %tp, error = %e, "could not position partition, will retry");
                    self.tracker.abandon(std::slice::from_ref(&tp));
                    self.unresumed.insert(tp);
                }
            }
        }
    }

    async fn commit_cycle(&mut self) {
        let attempted = self.tracker.committable();
        match self.tracker.commit().await {
            Ok(committed) => {
                if !committed.is_empty() {
                    self.stats.commits += 1;
                }
            }
            Err(e) => self.commit_failed(&e, &attempted),
        }
    }

    async fn commit_partitions(&mut self, partitions: &[TopicPartition]) {
        let attempted: CommitPoint = self
            .tracker
            .committable()
            .into_iter()
            .filter(|(tp, _)| partitions.contains(tp))
            .collect();

        match self.tracker.commit_partitions(partitions).await {
            Ok(committed) => {
                if !committed.is_empty() {
                    self.stats.commits += 1;
                }
            }
            Err(e) => self.commit_failed(&e, &attempted),
        }
    }

    fn commit_failed(&mut self, error: &Error, attempted: &CommitPoint) {
        self.stats.commit_failures += 1;
        let attempts = match error {
            Error::CommitFailure { attempts, .. } => *attempts,
            _ => 1,
        };
        for (tp, offset) in attempted {
            self.report(error, tp, Some(*offset), attempts, Disposition::Uncommitted);
        }
    }

    fn report(
        &self,
        error: &Error,
        tp: &TopicPartition,
        offset: Option<Offset>,
        attempts: u32,
        disposition: Disposition,
    ) {
        self.sink
            .report(&ErrorEvent::new(error, tp, offset, attempts, disposition));
    }

    fn dead_letter(&mut self, record: RawRecord, error: &Error, attempts: u32) {
        let event = ErrorEvent::new(
            error,
            &record.topic_partition(),
            Some(record.offset),
            attempts,
            Disposition::DeadLettered,
        );
        self.sink.dead_letter(DeadLetter::new(record, event));
        self.stats.dead_lettered += 1;
    }

    /// Final commit, then leave the group
    ///
    /// Commit failures here are reported and do not prevent leaving.
    pub async fn shutdown(mut self) -> Result<ConsumerStats> {
        if self.state() != LoopState::Stopped && self.tracker.has_uncommitted() {
            self.commit_cycle().await;
        }

        if let Err(e) = self.broker.close().await {
            warn!(member_id = %self.broker.member_id(), error = %e, "leaving group failed");
        }
        self.tracker.clear();
        self.transition(LoopState::Stopped);

        info!(
            member_id = %self.broker.member_id(),
            handled = self.stats.records_handled,
            dead_lettered = self.stats.dead_lettered,
            commits = self.stats.commits,
            "consumer stopped"
        );
        Ok(self.stats)
    }
}

async fn invoke_with_timeout<K, V>(
    handlers: &HandlerRegistry<K, V>,
    timeout: Option<Duration>,
    envelope: DecodedEnvelope<K, V>,
) -> Result<()>
where
    K: Send + 'static,
    V: Send + 'static,
{
    match timeout {
        Some(limit) => time::timeout(limit, handlers.invoke(envelope))
            .await
            .map_err(|_| {
                Error::Handler(format!("handler timed out after {} ms", limit.as_millis()))
            })?,
        None => handlers.invoke(envelope).await,
    }
}
