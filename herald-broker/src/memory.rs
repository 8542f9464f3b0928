//! Process-local broker with partitioned topics.
//!
//! Records are appended to per-partition logs and never removed. Each
//! consumer group keeps its own committed offset per partition, and each
//! subscription runs one task per partition, so ordering holds within a
//! partition while partitions progress independently.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tracing::{debug, info, warn};

use crate::{
    Acknowledgement, BrokerClient, BrokerConfig, BrokerError, BrokerMessage, GroupLease,
    MessageHandler, OutgoingMessage, RecordMetadata, Stop, Subscription, dispatch,
};

const DEFAULT_PARTITIONS: u32 = 3;

type GroupKey = (String, String);
type OffsetKey = (String, String, i32);

#[derive(Default)]
struct PartitionLog {
    records: RwLock<Vec<BrokerMessage>>,
    appended: Notify,
}

struct TopicLog {
    partitions: Vec<Arc<PartitionLog>>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Arc::new(PartitionLog::default())).collect(),
        }
    }
}

/// In-memory broker
pub struct InMemoryBroker {
    partitions: u32,
    redelivery_delay: Duration,
    topics: DashMap<String, Arc<TopicLog>>,
    groups: Arc<DashSet<GroupKey>>,
    offsets: Arc<DashMap<OffsetKey, i64>>,
    connected: AtomicBool,
    closing: watch::Sender<bool>,
    round_robin: AtomicU64,
    send_faults: Mutex<VecDeque<BrokerError>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker with three partitions per topic
    pub fn new() -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            partitions: DEFAULT_PARTITIONS,
            redelivery_delay: BrokerConfig::default().redelivery_delay,
            topics: DashMap::new(),
            groups: Arc::new(DashSet::new()),
            offsets: Arc::new(DashMap::new()),
            connected: AtomicBool::new(false),
            closing,
            round_robin: AtomicU64::new(0),
            send_faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a broker using the redelivery delay from `config`
    pub fn with_config(config: &BrokerConfig) -> Self {
        Self::new().with_redelivery_delay(config.redelivery_delay)
    }

    /// Set the number of partitions for topics created from now on
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Set the wait before a nacked record is delivered again
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Make the next sends fail with the given errors, one per call.
    pub async fn fail_next_sends<I>(&self, errors: I)
    where
        I: IntoIterator<Item = BrokerError>,
    {
        self.send_faults.lock().await.extend(errors);
    }

    /// All records of a topic, ordered by partition then offset
    pub async fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        let Some(log) = self.topics.get(topic).map(|t| t.value().clone()) else {
            return Vec::new();
        };

        let mut all = Vec::new();
        for partition in &log.partitions {
            all.extend(partition.records.read().await.iter().cloned());
        }
        all
    }

    /// Next offset the group will read from `partition`, if it committed anything
    pub fn committed_offset(&self, topic: &str, group: &str, partition: i32) -> Option<i64> {
        self.offsets
            .get(&(topic.to_string(), group.to_string(), partition))
            .map(|o| *o.value())
    }

    /// Number of records per partition of a topic
    pub async fn partition_sizes(&self, topic: &str) -> HashMap<i32, usize> {
        let mut sizes = HashMap::new();
        if let Some(log) = self.topics.get(topic).map(|t| t.value().clone()) {
            for (index, partition) in log.partitions.iter().enumerate() {
                sizes.insert(index as i32, partition.records.read().await.len());
            }
        }
        sizes
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new(self.partitions)))
            .value()
            .clone()
    }

    fn partition_for(&self, key: Option<&str>, partitions: usize) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions as u64) as usize
            }
            None => {
                (self.round_robin.fetch_add(1, Ordering::Relaxed) % partitions as u64) as usize
            }
        }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.closing.send_replace(false);
        self.connected.store(true, Ordering::SeqCst);
        info!(partitions = self.partitions, "In-memory broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        info!("Closing in-memory broker");
        self.connected.store(false, Ordering::SeqCst);
        self.closing.send_replace(true);
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<RecordMetadata, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if let Some(fault) = self.send_faults.lock().await.pop_front() {
            debug!(topic, error = %fault, "Injected send failure");
            return Err(fault);
        }

        let log = self.topic(topic);
        let index = self.partition_for(message.key.as_deref(), log.partitions.len());
        let partition = &log.partitions[index];

        let offset = {
            let mut records = partition.records.write().await;
            let offset = records.len() as i64;
            records.push(BrokerMessage {
                topic: topic.to_string(),
                partition: index as i32,
                offset,
                key: message.key,
                value: message.value,
                timestamp: message.timestamp,
                headers: message.headers,
            });
            offset
        };
        partition.appended.notify_waiters();

        debug!(topic, partition = index, offset, "Record appended");
        Ok(RecordMetadata {
            partition: index as i32,
            offset,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let mut subscription = Subscription::new(GroupLease::acquire(&self.groups, topic, group)?);

        let log = self.topic(topic);
        for (index, partition) in log.partitions.iter().enumerate() {
            let worker = PartitionWorker {
                topic: topic.to_string(),
                group: group.to_string(),
                partition: index as i32,
                log: partition.clone(),
                handler: handler.clone(),
                offsets: self.offsets.clone(),
                redelivery_delay: self.redelivery_delay,
                stop: Stop::new(subscription.shutdown_signal(), self.closing.subscribe()),
                _lease: subscription.lease(),
            };
            subscription.push_worker(tokio::spawn(worker.run()));
        }

        info!(topic, group, partitions = log.partitions.len(), "Subscribed to in-memory topic");
        Ok(subscription)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct PartitionWorker {
    topic: String,
    group: String,
    partition: i32,
    log: Arc<PartitionLog>,
    handler: Arc<dyn MessageHandler>,
    offsets: Arc<DashMap<OffsetKey, i64>>,
    redelivery_delay: Duration,
    stop: Stop,
    _lease: Arc<GroupLease>,
}

impl PartitionWorker {
    async fn run(mut self) {
        let key = (self.topic.clone(), self.group.clone(), self.partition);
        let mut cursor = self.offsets.get(&key).map(|o| *o.value()).unwrap_or(0);

        while !self.stop.is_set() {
            let log = self.log.clone();
            let appended = log.appended.notified();
            let next = log.records.read().await.get(cursor as usize).cloned();

            let message = match next {
                Some(message) => message,
                None => {
                    tokio::select! {
                        _ = appended => {}
                        _ = self.stop.wait() => break,
                    }
                    continue;
                }
            };

            match dispatch(self.handler.as_ref(), &message).await {
                Acknowledgement::Ack => {
                    cursor += 1;
                    self.offsets.insert(key.clone(), cursor);
                }
                Acknowledgement::Nack => {
                    warn!(
                        topic = %self.topic,
                        group = %self.group,
                        partition = self.partition,
                        offset = message.offset,
                        delay = ?self.redelivery_delay,
                        "Message not acknowledged, redelivering"
                    );
                    if self.stop.sleep(self.redelivery_delay).await {
                        break;
                    }
                }
            }
        }

        debug!(
            topic = %self.topic,
            group = %self.group,
            partition = self.partition,
            "Consumer task stopped"
        );
    }
}
