//! Message source bindings.
//!
//! A [`Subscription`] binds a handler to a `(topic, routing key)` pair. The
//! routing key travels as the Kafka message key. [`KafkaMessageSource`]
//! consumes every bound topic and hands matching messages to a [`Dispatcher`],
//! which runs each on its own task, bounded by a semaphore, and drains them on
//! shutdown.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur while consuming messages
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),
}

/// Metadata about a received message
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}

/// A received message with an owned payload
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    /// Message key as a string, i.e. the routing key
    pub fn key_str(&self) -> Option<&str> {
        self.metadata
            .key
            .as_deref()
            .and_then(|k| std::str::from_utf8(k).ok())
    }

    fn from_kafka<M: Message>(msg: &M) -> Self {
        Self {
            payload: msg.payload().unwrap_or(&[]).to_vec(),
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(|k| k.to_vec()),
                timestamp: msg.timestamp().to_millis(),
            },
        }
    }
}

/// Handler invoked once per matching message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when `handle` fails
    async fn on_error(&self, message: &IncomingMessage, error: ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Message processing failed"
        );
    }
}

/// Explicit binding of a handler to a topic and routing key
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    routing_key: String,
    handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn bind(
        topic: impl Into<String>,
        routing_key: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            topic: topic.into(),
            routing_key: routing_key.into(),
            handler,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether a message on `topic` with `key` belongs to this binding
    pub fn matches(&self, topic: &str, key: Option<&str>) -> bool {
        self.topic == topic && key == Some(self.routing_key.as_str())
    }

    /// Run the handler for one message, reporting failures through `on_error`
    pub async fn dispatch(&self, message: IncomingMessage) {
        if let Err(e) = self.handler.handle(&message).await {
            metrics::counter!("gallery.messages.failed").increment(1);
            self.handler.on_error(&message, e).await;
        } else {
            metrics::counter!("gallery.messages.handled").increment(1);
        }
    }
}

/// Runs matched messages on tracked tasks, at most `concurrency` at a time
pub struct Dispatcher {
    subscriptions: Vec<Subscription>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(subscriptions: Vec<Subscription>, concurrency: usize) -> Self {
        Self {
            subscriptions,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: TaskTracker::new(),
        }
    }

    /// Wait for a free handler slot; `None` once the pool is closed
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Hand a message to the first matching subscription on its own task.
    ///
    /// Returns `false` when nothing matched; the permit is released then.
    pub fn route(&self, message: IncomingMessage, permit: OwnedSemaphorePermit) -> bool {
        let Some(subscription) = self
            .subscriptions
            .iter()
            .find(|s| s.matches(&message.metadata.topic, message.key_str()))
            .cloned()
        else {
            debug!(
                topic = %message.metadata.topic,
                key = ?message.key_str(),
                "No subscription for message, skipping"
            );
            return false;
        };

        self.tasks.spawn(async move {
            subscription.dispatch(message).await;
            drop(permit);
        });
        true
    }

    /// Stop accepting work and wait for every running handler to finish
    pub async fn drain(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "Waiting for in-flight handlers");
        }
        self.tasks.wait().await;
    }
}

/// Kafka consumer dispatching to bound subscriptions
pub struct KafkaMessageSource {
    consumer: StreamConsumer,
    dispatcher: Dispatcher,
    shutdown_tx: broadcast::Sender<()>,
}

impl KafkaMessageSource {
    /// Create the consumer and subscribe to every bound topic
    pub fn new(config: &KafkaConfig, subscriptions: Vec<Subscription>) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", config.enable_auto_commit.to_string())
            .set("session.timeout.ms", config.session_timeout_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let topics: BTreeSet<&str> = subscriptions.iter().map(|s| s.topic()).collect();
        let topics: Vec<&str> = topics.into_iter().collect();

        consumer
            .subscribe(&topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        for subscription in &subscriptions {
            info!(
                topic = %subscription.topic(),
                routing_key = %subscription.routing_key(),
                group = %config.consumer_group,
                "Bound message handler"
            );
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            dispatcher: Dispatcher::new(subscriptions, config.handler_concurrency),
            shutdown_tx,
        })
    }

    /// Handle used to stop [`KafkaMessageSource::run`]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Consume until shutdown or until the stream ends, then drain handlers
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ConsumerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut stream = self.consumer.stream();

        info!("Starting message consumption loop");

        loop {
            // Broker polling waits while every handler slot is taken.
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                permit = self.dispatcher.acquire() => match permit {
                    Some(permit) => permit,
                    None => {
                        error!("Handler pool closed");
                        break;
                    }
                },
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed)) => {
                            let incoming = IncomingMessage::from_kafka(&borrowed);
                            self.dispatcher.route(incoming, permit);
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka consumer error");
                            metrics::counter!("gallery.kafka.errors").increment(1);
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.dispatcher.drain().await;
        info!("Message consumption stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<String>>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.seen.lock().push(message.payload.clone());
            if self.fail {
                return Err(ConsumerError::ProcessingError("boom".into()));
            }
            Ok(())
        }

        async fn on_error(&self, _message: &IncomingMessage, error: ConsumerError) {
            self.errors.lock().push(error.to_string());
        }
    }

    fn message(topic: &str, key: Option<&str>, payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            payload: payload.to_vec(),
            metadata: MessageMetadata {
                topic: topic.to_string(),
                key: key.map(|k| k.as_bytes().to_vec()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_subscription_matches_topic_and_routing_key() {
        let subscription = Subscription::bind(
            "gallery",
            "comments.new",
            Arc::new(RecordingHandler::default()),
        );

        assert!(subscription.matches("gallery", Some("comments.new")));
        assert!(!subscription.matches("gallery", Some("comments.old")));
        assert!(!subscription.matches("gallery", None));
        assert!(!subscription.matches("other-exchange", Some("comments.new")));
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let subscription = Subscription::bind("t", "k", handler.clone());

        subscription.dispatch(message("t", Some("k"), b"payload")).await;

        assert_eq!(handler.seen.lock().as_slice(), &[b"payload".to_vec()]);
        assert!(handler.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_reports_failures_to_on_error() {
        let handler = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });
        let subscription = Subscription::bind("t", "k", handler.clone());

        subscription.dispatch(message("t", Some("k"), b"payload")).await;

        assert_eq!(handler.errors.lock().len(), 1);
        assert!(handler.errors.lock()[0].contains("boom"));
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_handlers() {
        let gate = Arc::new(Notify::new());
        let handler = Arc::new(RecordingHandler {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(vec![Subscription::bind("t", "k", handler.clone())], 4);

        let permit = dispatcher.acquire().await.unwrap();
        assert!(dispatcher.route(message("t", Some("k"), b"in flight"), permit));

        let early = tokio::time::timeout(Duration::from_millis(50), dispatcher.drain()).await;
        assert!(early.is_err());
        assert!(handler.seen.lock().is_empty());

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), dispatcher.drain())
            .await
            .unwrap();

        assert_eq!(handler.seen.lock().as_slice(), &[b"in flight".to_vec()]);
    }

    #[tokio::test]
    async fn test_unmatched_message_releases_its_slot() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(vec![Subscription::bind("t", "k", handler.clone())], 1);

        let permit = dispatcher.acquire().await.unwrap();
        assert!(!dispatcher.route(message("t", Some("other"), b"skipped"), permit));

        let permit = tokio::time::timeout(Duration::from_secs(1), dispatcher.acquire())
            .await
            .unwrap();
        assert!(permit.is_some());

        drop(permit);
        dispatcher.drain().await;
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_saturated_pool_holds_back_the_next_message() {
        let dispatcher = Dispatcher::new(Vec::new(), 1);

        let held = dispatcher.acquire().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), dispatcher.acquire()).await;
        assert!(waiting.is_err());

        drop(held);
        assert!(dispatcher.acquire().await.is_some());
    }

    #[test]
    fn test_decode_json_and_key() {
        let msg = message("t", Some("comments.new"), br#"{"a": 1}"#);
        let value: serde_json::Value = msg.decode_json().unwrap();

        assert_eq!(value["a"], 1);
        assert_eq!(msg.key_str(), Some("comments.new"));

        let bad = message("t", None, b"not json");
        assert!(matches!(
            bad.decode_json::<serde_json::Value>(),
            Err(ConsumerError::DeserializationError(_))
        ));
    }
}
