//! Redpanda event bus for the failsafe engine.
//!
//! Implements [`EventBus`] with rdkafka, so it works against Redpanda or any
//! other Kafka-compatible broker.
//!
//! # Delivery Semantics
//!
//! - **Publish**: accepted once the broker acknowledged the record
//! - **Partitioning**: the envelope key (the request id) is the record key, so
//!   every message of one request lands on one partition, in order
//! - **Subscribe**: at-least-once up to the subscriber's channel. An offset is
//!   committed once its record, and every earlier record of the partition, has
//!   been handed to the channel. The handler runs after that, so a crash
//!   between hand-off and handling loses the record.
//!
//! # Delayed Delivery
//!
//! Kafka has no native delayed delivery. [`publish_delayed`](EventBus::publish_delayed)
//! produces the record immediately with a [`DELIVER_AFTER_HEADER`] header holding
//! the due instant in epoch milliseconds. The subscriber parks such a record in a
//! timer queue and keeps reading; records that are due, or carry no header, are
//! yielded straight away. A parked record pins its partition's committed offset
//! until it is released, so a restart redelivers it.
//!
//! # Example
//!
//! ```no_run
//! use failsafe_redpanda::RedpandaEventBus;
//! use failsafe_core::event_bus::EventBus;
//! use failsafe_core::event::SerializedEvent;
//! use futures::StreamExt;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("failsafe")
//!     .build()?;
//!
//! let event = SerializedEvent::new("StatusChangeRequested.v1".to_string(), "7".to_string(), vec![1, 2, 3]);
//! event_bus
//!     .publish_delayed("failsafe-requests-change-status", &event, Duration::from_secs(5))
//!     .await?;
//!
//! let mut stream = event_bus.subscribe(&["failsafe-requests-change-status"]).await?;
//! while let Some(result) = stream.next().await {
//!     println!("Received: {:?}", result?.event_type);
//! }
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use failsafe_core::event::SerializedEvent;
use failsafe_core::event_bus::{EventBus, EventBusError, EventStream};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Record header carrying the earliest delivery instant, in epoch milliseconds.
pub const DELIVER_AFTER_HEADER: &str = "failsafe-deliver-after";

/// How long a publish may wait for the broker acknowledgement.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-compatible event bus.
///
/// One producer serves every publish. Each [`subscribe`](EventBus::subscribe)
/// call creates its own consumer in the configured group.
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    consumer_group: Option<String>,
    auto_offset_reset: String,
    buffer_size: usize,
}

impl RedpandaEventBus {
    /// Event bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring an event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Broker list this bus connects to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Group id for a subscription to `topics`.
    fn group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("failsafe-{}", sorted.join("-"))
        })
    }

    fn send(
        &self,
        topic: &str,
        event: &SerializedEvent,
        headers: Option<OwnedHeaders>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();

        Box::pin(async move {
            let payload = bincode::serialize(&event).map_err(|e| EventBusError::PublishFailed {
                topic: topic.clone(),
                reason: format!("Failed to encode envelope: {e}"),
            })?;

            let mut record = FutureRecord::to(&topic)
                .payload(&payload)
                .key(event.key.as_bytes());
            if let Some(headers) = headers {
                record = record.headers(headers);
            }

            let (partition, offset) = self
                .producer
                .send(record, Timeout::After(SEND_TIMEOUT))
                .await
                .map_err(|(e, _)| {
                    tracing::warn!(topic = %topic, key = %event.key, error = %e, "Broker rejected record");
                    EventBusError::PublishFailed {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    }
                })?;

            tracing::debug!(
                topic = %topic,
                partition,
                offset,
                key = %event.key,
                event_type = %event.event_type,
                "Record acknowledged"
            );
            Ok(())
        })
    }
}

/// Header set marking a record as due `delay` after `now_millis`.
fn deliver_after_headers(now_millis: i64, delay: Duration) -> OwnedHeaders {
    let delay_millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let due = now_millis.saturating_add(delay_millis).to_string();
    OwnedHeaders::new().insert(Header {
        key: DELIVER_AFTER_HEADER,
        value: Some(due.as_str()),
    })
}

/// Due instant carried by a record, if any.
fn deliver_after<H: Headers>(headers: Option<&H>) -> Option<i64> {
    headers?
        .iter()
        .find(|header| header.key == DELIVER_AFTER_HEADER)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.parse().ok())
}

/// How long to hold a record due at `due_millis`, seen at `now_millis`.
fn hold_for(due_millis: i64, now_millis: i64) -> Option<Duration> {
    let remaining = due_millis.checked_sub(now_millis)?;
    u64::try_from(remaining)
        .ok()
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
}

fn decode_record(payload: Option<&[u8]>) -> Result<SerializedEvent, EventBusError> {
    let payload = payload
        .ok_or_else(|| EventBusError::DeserializationFailed("Record has no payload".to_string()))?;
    bincode::deserialize(payload)
        .map_err(|e| EventBusError::DeserializationFailed(format!("Failed to decode envelope: {e}")))
}

/// A delayed record waiting for its due instant.
struct Parked {
    due: Instant,
    /// Arrival order, so records due at the same instant keep stream order.
    seq: u64,
    record: OwnedMessage,
}

impl PartialEq for Parked {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Parked {}

impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Parked {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Per-partition commit bookkeeping.
///
/// The committable offset is the lowest offset still parked or, with nothing
/// parked, one past the highest released offset.
#[derive(Debug, Default)]
struct CommitTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    parked: BTreeSet<i64>,
    next: i64,
}

impl CommitTracker {
    fn park(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .parked
            .insert(offset);
    }

    /// Mark `offset` as handed over and return the offset that may be committed.
    fn release(&mut self, topic: &str, partition: i32, offset: i64) -> i64 {
        let offsets = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        offsets.parked.remove(&offset);
        offsets.next = offsets.next.max(offset + 1);
        offsets.parked.first().copied().unwrap_or(offsets.next)
    }
}

fn commit(consumer: &StreamConsumer, topic: &str, partition: i32, offset: i64) {
    let mut positions = TopicPartitionList::new();
    let result = positions
        .add_partition_offset(topic, partition, Offset::Offset(offset))
        .and_then(|()| consumer.commit(&positions, CommitMode::Async));
    if let Err(e) = result {
        tracing::warn!(
            topic,
            partition,
            offset,
            error = %e,
            "Offset commit failed, record may be redelivered"
        );
    }
}

/// Sleep until `due`, or forever when nothing is parked.
async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Pump records from `consumer` into `tx` until the receiver goes away.
///
/// Delayed records are parked and released when due; reading continues in the
/// meantime.
async fn forward_records(
    consumer: StreamConsumer,
    tx: mpsc::Sender<Result<SerializedEvent, EventBusError>>,
) {
    let mut records = consumer.stream();
    let mut parked: BinaryHeap<Reverse<Parked>> = BinaryHeap::new();
    let mut commits = CommitTracker::default();
    let mut seq = 0u64;

    loop {
        let next_due = parked.peek().map(|Reverse(entry)| entry.due);

        let (record, released) = tokio::select! {
            received = records.next() => match received {
                Some(Ok(record)) => (record.detach(), false),
                Some(Err(e)) => {
                    let error = EventBusError::TransportError(format!("Failed to receive record: {e}"));
                    if tx.send(Err(error)).await.is_err() {
                        break;
                    }
                    continue;
                },
                None => break,
            },
            () = sleep_until_due(next_due) => {
                let Some(Reverse(entry)) = parked.pop() else {
                    continue;
                };
                (entry.record, true)
            },
        };

        let hold = if released {
            None
        } else {
            deliver_after(record.headers()).and_then(|due| hold_for(due, Utc::now().timestamp_millis()))
        };
        if let Some(hold) = hold {
            tracing::trace!(
                topic = record.topic(),
                offset = record.offset(),
                hold_ms = u64::try_from(hold.as_millis()).unwrap_or(u64::MAX),
                "Parking delayed record"
            );
            commits.park(record.topic(), record.partition(), record.offset());
            parked.push(Reverse(Parked {
                due: Instant::now() + hold,
                seq,
                record,
            }));
            seq += 1;
            continue;
        }

        if tx.send(decode_record(record.payload())).await.is_err() {
            break;
        }
        let committable = commits.release(record.topic(), record.partition(), record.offset());
        commit(&consumer, record.topic(), record.partition(), committable);
    }

    if !parked.is_empty() {
        tracing::debug!(parked = parked.len(), "Parked records left uncommitted for redelivery");
    }
    tracing::debug!("Subscriber dropped, consumer stopped");
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    buffer_size: Option<usize>,
}

impl RedpandaEventBusBuilder {
    /// Broker addresses, comma-separated.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode (`"0"`, `"1"` or `"all"`). Default `"all"`:
    /// a publish counts as accepted only once every in-sync replica has it.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Consumer group shared by every instance of the service.
    ///
    /// Without one, the group is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a new group starts reading. Default `"earliest"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Records buffered between the consumer and the subscriber. Default 1000.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Create the producer.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let bus = RedpandaEventBus {
            producer,
            brokers,
            consumer_group: self.consumer_group,
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string()),
            buffer_size: self.buffer_size.unwrap_or(1000).max(1),
        };

        tracing::info!(
            brokers = %bus.brokers,
            acks = %acks,
            consumer_group = ?bus.consumer_group,
            "Redpanda event bus ready"
        );
        Ok(bus)
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        self.send(topic, event, None)
    }

    fn publish_delayed(
        &self,
        topic: &str,
        event: &SerializedEvent,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        if delay.is_zero() {
            return self.send(topic, event, None);
        }
        let headers = deliver_after_headers(Utc::now().timestamp_millis(), delay);
        self.send(topic, event, Some(headers))
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let group = self.group_for(&topics);
            let subscription_failed = |reason: String| EventBusError::SubscriptionFailed {
                topics: topics.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| subscription_failed(e.to_string()))?;

            tracing::info!(topics = ?topics, consumer_group = %group, "Subscribed");

            let (tx, mut rx) = mpsc::channel(self.buffer_size);
            tokio::spawn(forward_records(consumer, tx));

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
