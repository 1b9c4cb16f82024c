use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, warn};
use uuid::Uuid;

use crate::stream::{
    error::{Error, ErrorKind},
    types::{Offset, Partition, RawRecord, TopicPartition},
};

/// What happened to the record (or progress) an error was about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Treated as processed; the offset advances
    Skipped,
    /// Sent to the dead-letter path; the offset advances
    DeadLettered,
    /// Will be attempted again
    Retrying,
    /// Ownership is gone; uncommitted progress dropped
    Abandoned,
    /// Progress stays pending until a later commit succeeds
    Uncommitted,
}

/// One reported failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub topic: String,
    pub partition: Partition,
    pub offset: Option<Offset>,
    pub message: String,
    pub attempts: u32,
    pub disposition: Disposition,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(
        error: &Error,
        tp: &TopicPartition,
        offset: Option<Offset>,
        attempts: u32,
        disposition: Disposition,
    ) -> Self {
        Self {
            kind: error.kind(),
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset,
            message: error.to_string(),
            attempts,
            disposition,
            occurred_at: Utc::now(),
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A record that will not be processed, kept with the reason
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub record: RawRecord,
    pub event: ErrorEvent,
}

impl DeadLetter {
    pub fn new(record: RawRecord, event: ErrorEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            record,
            event,
        }
    }
}

/// Destination for errors the dispatch loop absorbs
///
/// Called inline from the loop, so implementations should not block.
pub trait ErrorSink: Send + Sync {
    fn report(&self, event: &ErrorEvent);

    /// Preserve a record that exhausted its policy; reports it by default
    fn dead_letter(&self, letter: DeadLetter) {
        self.report(&letter.event);
    }
}

/// Writes every event to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, event: &ErrorEvent) {
        warn!(
            kind = %event.kind,
            topic = %event.topic,
            partition = event.partition,
            offset = ?event.offset,
            attempts = event.attempts,
            disposition = ?event.disposition,
            "{}",
            event.message
        );
    }

    fn dead_letter(&self, letter: DeadLetter) {
        error!(
            dead_letter_id = %letter.id,
            kind = %letter.event.kind,
            topic = %letter.event.topic,
            partition = letter.event.partition,
            offset = ?letter.event.offset,
            attempts = letter.event.attempts,
            key_len = letter.record.key.as_ref().map_or(0, |k| k.len()),
            value_len = letter.record.value.as_ref().map_or(0, |v| v.len()),
            "record dead-lettered: {}",
            letter.event.message
        );
    }
}

#[derive(Default)]
struct Collected {
    events: Vec<ErrorEvent>,
    dead_letters: Vec<DeadLetter>,
}

/// Keeps events and dead letters in memory; clones share the same storage
#[derive(Clone, Default)]
pub struct MemoryErrorSink {
    collected: Arc<Mutex<Collected>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reported events, dead letters included, in order
    pub fn events(&self) -> Vec<ErrorEvent> {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dead_letters
            .clone()
    }

    pub fn clear(&self) {
        let mut collected = self.collected.lock().unwrap_or_else(PoisonError::into_inner);
        collected.events.clear();
        collected.dead_letters.clear();
    }
}

impl ErrorSink for MemoryErrorSink {
    fn report(&self, event: &ErrorEvent) {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .push(event.clone());
    }

    fn dead_letter(&self, letter: DeadLetter) {
        let mut collected = self.collected.lock().unwrap_or_else(PoisonError::into_inner);
        collected.events.push(letter.event.clone());
        collected.dead_letters.push(letter);
    }
}
