use chrono::Local;
use consumer_pipeline::models::Notification;
use consumer_pipeline::stream::{
    broker::MemoryBroker,
    codec::{
        encode_frame, HttpSchemaRegistry, MemorySchemaRegistry, SchemaCache, SchemaId,
        SchemaRegistry, WireDecoder,
    },
    offsets::CommitPoint,
    Consumer, ConsumerConfig, Error, OffsetReset, Result, TopicPartition,
};
use apache_avro::Schema;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_TOPIC: &str = "notification-avro-v1";

/// Demo settings: `consumer-pipeline [count] [pause_ms] [id]`
#[derive(Debug)]
struct DemoOptions {
    message_count: usize,
    pause_ms: u64,
    notification_id: i64,
    partitions: i32,
    consumers: usize,
}

impl DemoOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        Ok(Self {
            message_count: parse_arg(args.first(), "message count", 100)?,
            pause_ms: parse_arg(args.get(1), "pause", 10)?,
            notification_id: parse_arg(args.get(2), "notification id", 0)?,
            partitions: parse_arg(std::env::var("DEMO_PARTITIONS").ok().as_ref(), "DEMO_PARTITIONS", 2)?,
            consumers: parse_arg(std::env::var("DEMO_CONSUMERS").ok().as_ref(), "DEMO_CONSUMERS", 2)?,
        })
    }
}

fn parse_arg<T: FromStr>(value: Option<&String>, name: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Validation(format!("{} must be a number, got '{}'", name, raw))),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "consumer pipeline failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = DemoOptions::from_args(&args)?;

    let mut config = ConsumerConfig::from_env()?;
    if config.topic.is_empty() {
        config.topic = DEFAULT_TOPIC.to_string();
    }
    // Records are seeded while the group forms, so read from the start unless told otherwise
    if std::env::var("STREAM_OFFSET_RESET").is_err() {
        config.offset_reset = OffsetReset::Earliest;
    }
    config.validate()?;

    let broker = MemoryBroker::new();
    broker.create_topic(&config.topic, options.partitions)?;

    if std::env::var("STREAM_BROKERS").is_ok() {
        warn!(
            brokers = ?config.brokers,
            "the demo runs an in-process broker; configured brokers are not contacted"
        );
    }

    let schema = Notification::schema()?;
    let (registry, schema_id) = match &config.schema_registry_url {
        Some(url) => {
            let http = HttpSchemaRegistry::new(url.clone())?;
            let subject = format!("{}-value", config.topic);
            let schema_id = http.register(&subject, &schema).await?;
            info!(url = %url, subject = %subject, schema_id, "registered notification schema");
            (Arc::new(http) as Arc<dyn SchemaRegistry>, schema_id)
        }
        None => {
            let memory = Arc::new(MemorySchemaRegistry::new());
            let schema_id = memory.register(schema.clone());
            (memory as Arc<dyn SchemaRegistry>, schema_id)
        }
    };
    let cache = Arc::new(SchemaCache::new(registry));

    info!(
        topic = %config.topic,
        group_id = %config.group_id,
        partitions = options.partitions,
        consumers = options.consumers,
        "starting consumer group"
    );

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for member in 0..options.consumers {
        let decoder = WireDecoder::<i64, Notification>::new(Arc::clone(&cache), schema.clone());
        let member_id = format!("{}-{}", config.client_id, member);

        let mut consumer = Consumer::new(
            broker.consumer_with_id(&config.group_id, member_id),
            config.clone(),
            decoder,
            Arc::new(broker.offset_store()),
        )?;

        consumer.on_record(|envelope| async move {
            let key = envelope
                .key()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "null".to_string());
            info!("received key = '{}' with payload='{}'", key, envelope.value());
            Ok(())
        })?;

        handles.push(consumer.handle());
        tasks.push(tokio::spawn(consumer.run()));
    }

    let seeded = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        seeded = seed(&broker, &config.topic, &schema, schema_id, &options) => Some(seeded?),
    };

    if let Some(seeded) = seeded {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            _ = wait_until_committed(&broker, &config.group_id, &seeded) => {
                info!(records = options.message_count, "all seeded records committed");
            }
        }
    }

    for handle in &handles {
        handle.shutdown();
    }

    for joined in futures::future::join_all(tasks).await {
        match joined {
            Ok(Ok(stats)) => info!(
                handled = stats.records_handled,
                dead_lettered = stats.dead_lettered,
                rebalances = stats.rebalances,
                "consumer finished"
            ),
            Ok(Err(e)) => error!(error = %e, "consumer failed"),
            Err(e) => error!(error = %e, "consumer task panicked"),
        }
    }

    Ok(())
}

/// Produce the demo notifications; returns the last offset written per partition
async fn seed(
    broker: &MemoryBroker,
    topic: &str,
    schema: &Schema,
    schema_id: SchemaId,
    options: &DemoOptions,
) -> Result<CommitPoint> {
    let id = options.notification_id;
    let mut last = CommitPoint::new();

    for index in 1..=options.message_count {
        let notification = Notification::new(
            id,
            format!("[{}] Hello Kafka {} => {}", id, index, Local::now().naive_local()),
        );
        let key = notification.key();
        let partition = broker.partition_for_key(topic, &key)?;
        let value = encode_frame(schema_id, &notification.to_avro(schema)?);

        let offset = broker.produce(topic, partition, Some(key), Some(value))?;
        last.insert(TopicPartition::new(topic, partition), offset);

        tokio::time::sleep(Duration::from_millis(options.pause_ms)).await;
    }

    Ok(last)
}

async fn wait_until_committed(broker: &MemoryBroker, group_id: &str, seeded: &CommitPoint) {
    loop {
        let done = seeded
            .iter()
            .all(|(tp, offset)| broker.committed(group_id, tp) >= Some(*offset));
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
