use std::{marker::PhantomData, time::Duration};

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;

use crate::sink::Publish;

/// Kafka publisher backend.
///
/// Publishes decoded payloads to Kafka topics using a `FutureProducer`.
/// Topic and key selection are derived from the payload itself, since the
/// engine hands the sink decoded events rather than stored envelopes.
///
/// ## Mapping
///
/// - `payload.topic()` → Kafka topic
/// - `payload.key()` → Kafka message key
/// - the payload, serialized as JSON → message body
///
/// ## Type Parameters
///
/// - `P`: payload type (phantom, inferred from `Publish`)
pub struct Kafka<P> {
    /// Kafka producer handle
    producer: FutureProducer,
    /// Timeout for sending messages
    timeout: Duration,
    /// Phantom type for payload
    _payload: PhantomData<P>,
}

impl<P> Kafka<P> {
    /// Create a new Kafka publisher using the given `FutureProducer`.
    ///
    /// Default timeout is 5 seconds.
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
            _payload: PhantomData,
        }
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl<P> Clone for Kafka<P> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
            timeout: self.timeout,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P> Publish<P> for Kafka<P>
where
    P: KafkaTopic + KafkaKey + Serialize + Send + Sync + 'static,
{
    type Error = tower::BoxError;

    /// Publish a payload to Kafka, waiting for broker acknowledgement up to
    /// the configured timeout.
    async fn publish(&mut self, payload: P) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&payload)?;

        let record = FutureRecord::to(payload.topic())
            .payload(&body)
            .key(payload.key());

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| e)?;

        Ok(())
    }
}

/// Provides the target Kafka topic for a payload.
pub trait KafkaTopic {
    /// Return the Kafka topic name.
    fn topic(&self) -> &str;
}

/// Provides the message key for Kafka.
///
/// Keys are used for partitioning and ordering in Kafka topics.
pub trait KafkaKey {
    /// Return the key as a byte slice.
    fn key(&self) -> &[u8];
}
