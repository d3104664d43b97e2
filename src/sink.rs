//! Message sink abstractions and publisher backends.
//!
//! This module defines the Tower-compatible seam the delivery fan-out
//! publishes decoded payloads through. The engine treats the sink as
//! fire-and-forget: a publish either succeeds or fails, and any retry or
//! idempotency policy lives on the sink's side of the seam.
//!
//! ## Key components
//!
//! - [`MessageSink`]: Public-facing wrapper implementing `tower::Service`
//! - [`PublisherService`]: Adapter from a [`Publish`] impl to a Tower service
//! - [`Publish`]: Trait implemented by concrete publisher backends
//! - [`SinkError`]: Unified error type with tracing context

pub mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::Service;
use tracing_error::SpanTrace;

pub use inmemory::InMemory;

/// Generic Tower-compatible sink wrapper.
///
/// `MessageSink` is the entry point the processor publishes through. It
/// wraps an underlying Tower `Service` and:
///
/// - Normalizes errors into [`SinkError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`publish`](MessageSink::publish) API
///
/// Typically constructed from a concrete [`Publish`] implementation.
#[derive(Clone)]
pub struct MessageSink<S> {
    service: S,
}

impl<D> MessageSink<PublisherService<D>> {
    /// Create a new sink from a concrete publisher backend.
    ///
    /// The publisher will be wrapped in a [`PublisherService`] to make it
    /// Tower-compatible.
    pub fn new(publisher: D) -> Self {
        Self {
            service: PublisherService::new(publisher),
        }
    }
}

impl<S> MessageSink<S> {
    /// Apply a Tower layer to the sink.
    ///
    /// This enables composition with middleware such as retries, timeouts,
    /// buffering, or tracing.
    pub fn layer<L>(self, layer: L) -> MessageSink<L::Service>
    where
        L: tower::Layer<S>,
    {
        MessageSink {
            service: layer.layer(self.service),
        }
    }
}

/// Tower `Service` implementation for `MessageSink`.
///
/// Delegates readiness and request handling to the inner service while
/// mapping all errors into [`SinkError`].
impl<P, S> Service<P> for MessageSink<S>
where
    S: Service<P> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    P: Send + 'static,
{
    type Response = ();
    type Error = SinkError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| SinkError::publish(e.into()))
    }

    fn call(&mut self, req: P) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| SinkError::publish(e.into()))?;
            Ok(())
        })
    }
}

impl<S> MessageSink<S> {
    /// Publish a decoded payload through the sink.
    ///
    /// This is a convenience method for callers that do not need direct
    /// access to the `tower::Service` API. It takes `&self` so concurrent
    /// fan-out units can share one sink; the inner service is cloned per
    /// call.
    pub async fn publish<P>(&self, payload: P) -> Result<(), SinkError>
    where
        S: Service<P> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        service
            .call(payload)
            .await
            .map_err(|e| SinkError::publish(e.into()))?;
        Ok(())
    }
}

/// Error returned by sink operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct SinkError {
    context: SpanTrace,
    kind: SinkErrorKind,
}

/// Sink error kinds.
#[derive(Debug)]
pub enum SinkErrorKind {
    /// Errors originating from the publisher backend.
    Publish(tower::BoxError),
    /// Errors related to payload serialization.
    Serde(tower::BoxError),
}

impl SinkError {
    /// Create a publisher-related sink error.
    pub fn publish(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SinkErrorKind::Publish(err),
        }
    }

    /// Create a serialization-related sink error.
    pub fn serde(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SinkErrorKind::Serde(err),
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SinkErrorKind::Publish(err) => writeln!(f, "Publish error: {err}"),
            SinkErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SinkErrorKind::Publish(err) => Some(err.as_ref()),
            SinkErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Publish`] backend.
///
/// This type bridges the [`Publish`] trait with Tower's `Service`
/// abstraction.
#[derive(Clone)]
pub struct PublisherService<D> {
    publisher: D,
}

impl<D> PublisherService<D> {
    /// Create a new publisher service from a backend.
    pub fn new(publisher: D) -> Self {
        Self { publisher }
    }
}

/// `tower::Service` implementation delegating to a [`Publish`] backend.
impl<P, D> Service<P> for PublisherService<D>
where
    P: Send + 'static,
    D: Publish<P> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: P) -> Self::Future {
        let mut publisher = self.publisher.clone();
        Box::pin(async move {
            publisher.publish(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete publisher backends.
///
/// A publisher is responsible for delivering a decoded payload to an
/// external system (e.g. Kafka, RabbitMQ, or an in-memory queue).
#[async_trait::async_trait]
pub trait Publish<P> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Publish a payload to the underlying system.
    async fn publish(&mut self, payload: P) -> Result<(), Self::Error>;
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone)]
pub struct RawPayload(pub(crate) Vec<u8>);

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Trait for values that can be viewed as raw bytes.
///
/// This abstraction avoids unnecessary allocations when handling payloads.
pub trait ToBytes {
    /// Convert the value into a byte slice.
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for [u8] {
    fn to_bytes(&self) -> &[u8] {
        self
    }
}

impl ToBytes for str {
    fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ToBytes for Vec<u8> {
    fn to_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ToBytes for String {
    fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        self.0.to_bytes()
    }
}
