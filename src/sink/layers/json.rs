use std::{future::Future, pin::Pin};

use tower::{Layer, Service};

use crate::sink::RawPayload;

/// Tower `Service` wrapper that serializes payloads to JSON.
///
/// This service converts any payload type `P` that implements
/// `serde::Serialize` into a [`RawPayload`] containing the serialized JSON
/// bytes before passing it to the inner service. Useful for pipelines where
/// the publisher expects raw bytes instead of structured types.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, P> Service<P> for JsonService<T>
where
    P: serde::Serialize + Send + 'static,
    T: Service<RawPayload> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: P) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let bytes = serde_json::to_vec(&req).map_err(Box::new)?;

            inner.call(RawPayload(bytes)).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`JsonService`] to a service stack.
///
/// Wraps an existing service so that all outgoing payloads are serialized
/// to JSON automatically.
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{InMemory, MessageSink, ToBytes};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Greeting {
        message: String,
    }

    #[tokio::test]
    async fn serializes_payloads_before_the_publisher() {
        let publisher: InMemory<RawPayload> = InMemory::default();
        let sink = MessageSink::new(publisher.clone()).layer(JsonLayer);

        sink.publish(Greeting {
            message: "hello".into(),
        })
        .await
        .unwrap();

        let published = publisher.published_payloads().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].to_bytes(), br#"{"message":"hello"}"#);
    }
}
