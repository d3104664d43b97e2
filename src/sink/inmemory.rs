use std::sync::Arc;

use tokio::sync::Mutex;

use crate::sink::Publish;

/// In-memory publisher for testing or local pipelines.
///
/// Stores published payloads in a shared queue. It is useful for:
/// - Unit and integration testing
/// - Simulating delivery without a real broker
/// - Debugging message flows
pub struct InMemory<P> {
    /// Shared payload queue
    published: Arc<Mutex<Vec<P>>>,
}

impl<P> InMemory<P> {
    /// Return all payloads that have been "published" and clear the
    /// internal queue.
    ///
    /// Primarily intended for testing purposes.
    pub async fn published_payloads(&self) -> Vec<P> {
        let mut queue = self.published.lock().await;
        std::mem::take(&mut *queue)
    }

    /// Number of payloads currently held.
    pub async fn published_count(&self) -> usize {
        self.published.lock().await.len()
    }
}

impl<P> Clone for InMemory<P> {
    fn clone(&self) -> Self {
        Self {
            published: Arc::clone(&self.published),
        }
    }
}

impl<P> Default for InMemory<P> {
    /// Create a new empty in-memory publisher.
    fn default() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait::async_trait]
impl<P> Publish<P> for InMemory<P>
where
    P: std::fmt::Debug + Send,
{
    type Error = std::io::Error;

    /// "Publish" a payload by appending it to the in-memory queue.
    #[tracing::instrument(skip_all)]
    async fn publish(&mut self, payload: P) -> Result<(), Self::Error> {
        tracing::debug!(?payload, "Payload published to in-memory queue");
        let mut queue = self.published.lock().await;
        queue.push(payload);
        Ok(())
    }
}
