//! Apache Kafka backend

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use futures_util::StreamExt;
use rdkafka::Message as KafkaMessage;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::{
    Acknowledgement, BrokerClient, BrokerConfig, BrokerError, BrokerMessage, GroupLease,
    MessageHandler, OutgoingMessage, RecordMetadata, Stop, Subscription, dispatch,
};

/// Apache Kafka broker client
pub struct KafkaBroker {
    config: BrokerConfig,
    producer: RwLock<Option<FutureProducer>>,
    groups: Arc<DashSet<(String, String)>>,
    connected: AtomicBool,
    closing: watch::Sender<bool>,
}

impl KafkaBroker {
    /// Create a client; no connection is made until [`BrokerClient::connect`].
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let (closing, _) = watch::channel(false);
        Ok(Self {
            config,
            producer: RwLock::new(None),
            groups: Arc::new(DashSet::new()),
            connected: AtomicBool::new(false),
            closing,
        })
    }

    /// Create a client from `KAFKA_*` environment variables
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::new(BrokerConfig::from_env()?)
    }

    /// Get the configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn client_config(&self) -> ClientConfig {
        let config = &self.config;
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", config.bootstrap_servers());
        client_config.set("client.id", &config.client_id);
        client_config.set(
            "socket.connection.setup.timeout.ms",
            config.connection_timeout.as_millis().to_string(),
        );

        match (&config.credentials, config.tls) {
            (Some(credentials), tls) => {
                let protocol = if tls { "SASL_SSL" } else { "SASL_PLAINTEXT" };
                client_config.set("security.protocol", protocol);
                client_config.set("sasl.mechanism", credentials.mechanism.as_str());
                client_config.set("sasl.username", &credentials.username);
                client_config.set("sasl.password", &credentials.password);
            }
            (None, true) => {
                client_config.set("security.protocol", "SSL");
            }
            (None, false) => {}
        }

        if config.tls
            && let Some(ref tls_config) = config.tls_config
        {
            if let Some(ref ca_cert) = tls_config.ca_cert {
                client_config.set("ssl.ca.location", ca_cert);
            }
            if let Some(ref client_cert) = tls_config.client_cert {
                client_config.set("ssl.certificate.location", client_cert);
            }
            if let Some(ref client_key) = tls_config.client_key {
                client_config.set("ssl.key.location", client_key);
            }
        }

        for (key, value) in &config.options {
            client_config.set(key, value);
        }

        client_config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut client_config = self.client_config();
        let request_timeout = self.config.request_timeout.as_millis().to_string();
        client_config
            .set("request.timeout.ms", &request_timeout)
            .set("message.timeout.ms", &request_timeout)
            .set("retry.backoff.ms", self.config.retry.initial_delay.as_millis().to_string())
            .set("retry.backoff.max.ms", self.config.retry.max_delay.as_millis().to_string());
        client_config
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut client_config = self.client_config();
        client_config
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");
        client_config
    }

    fn handshake_timeout(&self) -> Duration {
        if self.config.is_authenticated() {
            self.config.connection_timeout + self.config.authentication_timeout
        } else {
            self.config.connection_timeout
        }
    }
}

fn build_headers(headers: &HashMap<String, String>) -> OwnedHeaders {
    headers.iter().fold(OwnedHeaders::new(), |acc, (key, value)| {
        acc.insert(Header {
            key,
            value: Some(value.as_bytes()),
        })
    })
}

fn to_broker_message<M: KafkaMessage>(kafka_msg: &M) -> BrokerMessage {
    let mut headers = HashMap::new();
    if let Some(kafka_headers) = kafka_msg.headers() {
        for header in kafka_headers.iter() {
            if let Some(value) = header.value {
                let value = String::from_utf8_lossy(value).to_string();
                headers.insert(header.key.to_string(), value);
            }
        }
    }

    let timestamp = kafka_msg
        .timestamp()
        .to_millis()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .unwrap_or_else(chrono::Utc::now);

    BrokerMessage {
        topic: kafka_msg.topic().to_string(),
        partition: kafka_msg.partition(),
        offset: kafka_msg.offset(),
        key: kafka_msg.key().map(|k| String::from_utf8_lossy(k).to_string()),
        value: kafka_msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp,
        headers,
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        info!(
            brokers = %self.config.bootstrap_servers(),
            authenticated = self.config.is_authenticated(),
            "Connecting to Kafka"
        );

        let producer: FutureProducer = self.producer_config().create()?;

        // Metadata fetch blocks on librdkafka; it proves the brokers are
        // reachable and the credentials accepted.
        let client = producer.clone();
        let timeout = self.handshake_timeout();
        tokio::task::spawn_blocking(move || {
            client.client().fetch_metadata(None, timeout).map(|_| ())
        })
        .await
        .map_err(|e| BrokerError::Other(e.to_string()))??;

        *self.producer.write().await = Some(producer);
        self.closing.send_replace(false);
        self.connected.store(true, Ordering::SeqCst);

        info!("Connected to Kafka successfully");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        info!("Closing Kafka connections");
        self.connected.store(false, Ordering::SeqCst);
        self.closing.send_replace(true);

        if let Some(producer) = self.producer.write().await.take() {
            let timeout = self.config.request_timeout;
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| BrokerError::Other(e.to_string()))??;
        }
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<RecordMetadata, BrokerError> {
        let producer = self
            .producer
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)?;

        let headers = build_headers(&message.headers);
        let mut record = FutureRecord::to(topic)
            .payload(&message.value)
            .headers(headers)
            .timestamp(message.timestamp.timestamp_millis());

        if let Some(ref key) = message.key {
            record = record.key(key);
        }

        debug!(topic, key = ?message.key, "Producing record to Kafka");

        let delivery = producer
            .send(record, Timeout::After(self.config.request_timeout))
            .await
            .map_err(|(e, _)| BrokerError::from(e))?;

        Ok(RecordMetadata {
            partition: delivery.partition,
            offset: delivery.offset,
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

        let lease = GroupLease::acquire(&self.groups, topic, group)?;
        let consumer: StreamConsumer = self.consumer_config(group).create()?;
        consumer.subscribe(&[topic])?;

        let mut subscription = Subscription::new(lease);
        let worker = ConsumerWorker {
            consumer,
            handler,
            redelivery_delay: self.config.redelivery_delay,
            stop: Stop::new(subscription.shutdown_signal(), self.closing.subscribe()),
            _lease: subscription.lease(),
        };
        subscription.push_worker(tokio::spawn(worker.run()));

        info!(topic, group, "Subscribed to Kafka topic");
        Ok(subscription)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Consumes one (topic, group) subscription.
///
/// A nacked record is retried after the redelivery delay by seeking its
/// partition back to it. The stream keeps being polled in between, so a
/// slow retry never exceeds `max.poll.interval.ms`.
struct ConsumerWorker {
    consumer: StreamConsumer,
    handler: Arc<dyn MessageHandler>,
    redelivery_delay: Duration,
    stop: Stop,
    _lease: Arc<GroupLease>,
}

impl ConsumerWorker {
    async fn run(mut self) {
        let mut stream = self.consumer.stream();
        let mut rewinds = Rewinds::default();
        let mut retry: Option<BrokerMessage> = None;

        while !self.stop.is_set() {
            let message = match retry.take() {
                Some(message) => message,
                None => {
                    let next = tokio::select! {
                        next = stream.next() => next,
                        _ = self.stop.wait() => break,
                    };
                    match next {
                        Some(Ok(borrowed)) => to_broker_message(&borrowed),
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka consumer error");
                            continue;
                        }
                        None => {
                            debug!("Consumer stream ended");
                            break;
                        }
                    }
                }
            };

            if !rewinds.admit(&message) {
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Dropping record prefetched before rewind"
                );
                continue;
            }

            match dispatch(self.handler.as_ref(), &message).await {
                Acknowledgement::Ack => {
                    if let Err(e) = commit(&self.consumer, &message) {
                        error!(
                            topic = %message.topic,
                            offset = message.offset,
                            error = %e,
                            "Offset commit failed"
                        );
                    }
                }
                Acknowledgement::Nack => {
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        delay = ?self.redelivery_delay,
                        "Message not acknowledged, redelivering"
                    );
                    if self.stop.sleep(self.redelivery_delay).await {
                        break;
                    }

                    let rewound = self.consumer.seek(
                        &message.topic,
                        message.partition,
                        Offset::Offset(message.offset),
                        Timeout::After(Duration::ZERO),
                    );
                    match rewound {
                        Ok(()) => rewinds.rewind(&message),
                        Err(e) => {
                            warn!(
                                topic = %message.topic,
                                partition = message.partition,
                                error = %e,
                                "Seek failed, redelivering in place"
                            );
                            retry = Some(message);
                        }
                    }
                }
            }
        }

        debug!("Kafka consumer task stopped");
    }
}

/// Partitions seeked back to a nacked record.
///
/// Records fetched before the seek may still arrive; anything past the
/// rewind point is dropped until the nacked record comes back.
#[derive(Debug, Default)]
struct Rewinds {
    pending: HashMap<(String, i32), i64>,
}

impl Rewinds {
    fn rewind(&mut self, message: &BrokerMessage) {
        self.pending
            .insert((message.topic.clone(), message.partition), message.offset);
    }

    fn admit(&mut self, message: &BrokerMessage) -> bool {
        let key = (message.topic.clone(), message.partition);
        match self.pending.get(&key) {
            Some(&target) if message.offset > target => false,
            Some(_) => {
                self.pending.remove(&key);
                true
            }
            None => true,
        }
    }
}

fn commit(consumer: &StreamConsumer, message: &BrokerMessage) -> Result<(), BrokerError> {
    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(
        &message.topic,
        message.partition,
        Offset::Offset(message.offset + 1),
    )?;
    consumer.commit(&offsets, CommitMode::Async)?;
    Ok(())
}
