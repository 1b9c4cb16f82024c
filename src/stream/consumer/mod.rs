/// Consumer module implementing the dispatch loop
///
/// This module provides:
/// - `Consumer`: The dispatch loop for one consumer group member
/// - `HandlerRegistry`: The single record callback
/// - `ErrorSink`: Where absorbed errors and dead letters go
/// - `ConsumerHandle`: State observation and shutdown from another task
///
/// # Consumer Pattern
///
/// 1. **Join**: Subscribe to the topic and wait for a partition assignment
/// 2. **Resume**: Seek each assigned partition one past its committed offset
/// 3. **Poll**: Fetch a bounded batch of records
/// 4. **Dispatch**: Decode each record and hand it to the handler, in order per partition
/// 5. **Commit**: Persist the highest contiguous processed offset per partition
/// 6. **Repeat**: Until shutdown, reacting to rebalances between records
///
/// # Failure Handling
///
/// - Undecodable records (`CorruptEncoding`, `SchemaMismatch`) are dead-lettered and skipped
/// - Handler failures follow the configured `FailurePolicy`
/// - Commit failures are retried with backoff and reported; consumption continues
/// - Lost assignments drop uncommitted progress and rejoin the group
///
/// # Example
///
/// ```no_run
/// use consumer_pipeline::stream::broker::MemoryBroker;
/// use consumer_pipeline::stream::codec::{MemorySchemaRegistry, SchemaCache, WireDecoder};
/// use consumer_pipeline::stream::consumer::{Consumer, MemoryErrorSink};
/// use consumer_pipeline::stream::ConsumerConfig;
/// use apache_avro::Schema;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let broker = MemoryBroker::new();
///     broker.create_topic("greetings", 1)?;
///
///     let cache = Arc::new(SchemaCache::new(Arc::new(MemorySchemaRegistry::new())));
///     let decoder = WireDecoder::<String, String>::new(cache, Schema::parse_str(r#""string""#)?);
///
///     let sink = MemoryErrorSink::new();
///     let mut consumer = Consumer::new(
///         broker.consumer("greeters"),
///         ConsumerConfig::new("greetings", "greeters"),
///         decoder,
///         Arc::new(broker.offset_store()),
///     )?
///     .with_error_sink(Arc::new(sink.clone()));
///
///     consumer.on_record(|envelope| async move {
///         println!("{}", envelope.value());
///         Ok(())
///     })?;
///
///     consumer.start().await?;
///     consumer.poll_once().await?;
///     let stats = consumer.shutdown().await?;
///
///     println!("{} record(s), {} error(s)", stats.records_received, sink.events().len());
///     Ok(())
/// }
/// ```

pub mod consumer;
pub mod handler;
pub mod sink;
pub mod state;

pub use consumer::{Consumer, ConsumerStats};
pub use handler::{HandlerRegistry, HandlerResult, MessageHandler};
pub use sink::{DeadLetter, Disposition, ErrorEvent, ErrorSink, MemoryErrorSink, TracingErrorSink};
pub use state::{ConsumerHandle, LoopState};
