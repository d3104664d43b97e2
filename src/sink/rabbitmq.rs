use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use lapin::{BasicProperties, options::BasicPublishOptions};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::sink::Publish;

/// RabbitMQ publisher backend.
///
/// Publishes decoded payloads to a RabbitMQ exchange using a shared
/// `lapin::Channel`.
///
/// ## Design
///
/// - Payloads are published to a **single exchange**
/// - The routing key is derived from the payload
/// - The body is the payload serialized as JSON
///
/// The channel is wrapped in `Arc<Mutex<_>>` because:
/// - `lapin::Channel` is not `Sync`
/// - `Publish::publish` is async and may be called concurrently
///
/// ## Type Parameters
///
/// - `P`: payload type (phantom, inferred from `Publish`)
pub struct RabbitMq<P> {
    /// Shared AMQP channel used for publishing.
    channel: Arc<Mutex<lapin::Channel>>,
    /// Target exchange name.
    exchange: String,
    /// Marker for the payload type.
    _payload: PhantomData<P>,
}

impl<P> RabbitMq<P> {
    /// Create a new publisher over a channel and target exchange.
    pub fn new(channel: lapin::Channel, exchange: impl Into<String>) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            exchange: exchange.into(),
            _payload: PhantomData,
        }
    }
}

impl<P> Clone for RabbitMq<P> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            exchange: self.exchange.clone(),
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P> Publish<P> for RabbitMq<P>
where
    P: RoutingKey + Serialize + Send + Sync + 'static,
{
    type Error = tower::BoxError;

    /// Publish a payload to RabbitMQ.
    ///
    /// The call waits for both:
    /// - the publish to be sent
    /// - the broker confirmation (publisher confirms)
    async fn publish(&mut self, payload: P) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&payload)?;

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &self.exchange,
                payload.routing_key(),
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default(),
            )
            .await?
            .await?;

        Ok(())
    }
}

/// Provides the routing key used when publishing to RabbitMQ.
///
/// This trait is intentionally minimal to avoid coupling payload types to
/// RabbitMQ-specific types.
pub trait RoutingKey {
    /// Return the routing key for the payload.
    fn routing_key(&self) -> &str;
}
