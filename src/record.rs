use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A pending outbox row, as fetched by a store adapter.
///
/// Records are written by some producer transactionally alongside its
/// business state; the engine only ever reads them back. The terminal
/// columns (`processed_on_utc`, `error`) stay in the store and are written
/// through [`OutboxUpdate`]s.
///
/// ## Fields
///
/// - `id` is assigned by the producer at insertion time and is immutable
/// - `type_name` is the tag the type registry resolves to a decoder
/// - `content` is opaque to the engine except for decoding
/// - `occurred_on_utc` defines the FIFO fetch order within a batch
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Producer-assigned unique identifier.
    pub id: Uuid,
    /// Payload type tag (e.g. a fully-qualified event name).
    pub type_name: String,
    /// Serialized payload.
    pub content: serde_json::Value,
    /// Timestamp the event was produced.
    pub occurred_on_utc: DateTime<Utc>,
}

/// The write-back tuple for one record's delivery outcome.
///
/// Produced by the delivery fan-out and consumed by the outcome write-back
/// within the same cycle, then discarded. `processed_on_utc` is captured at
/// outcome time; a non-`None` `error` means the record's single delivery
/// attempt failed and the diagnostic was recorded instead.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxUpdate {
    /// Identifier of the record this outcome belongs to.
    pub id: Uuid,
    /// When the delivery attempt was recorded.
    pub processed_on_utc: DateTime<Utc>,
    /// Diagnostic text when the attempt failed.
    pub error: Option<String>,
}

impl OutboxUpdate {
    /// Outcome for a successfully delivered record.
    pub fn delivered(id: Uuid) -> Self {
        Self {
            id,
            processed_on_utc: Utc::now(),
            error: None,
        }
    }

    /// Outcome for a record whose delivery attempt failed.
    ///
    /// The record still becomes terminal; there is no re-queue.
    pub fn failed(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id,
            processed_on_utc: Utc::now(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_outcome_has_no_error() {
        let id = Uuid::new_v4();
        let update = OutboxUpdate::delivered(id);

        assert_eq!(update.id, id);
        assert!(update.error.is_none());
    }

    #[test]
    fn failed_outcome_records_diagnostic() {
        let id = Uuid::new_v4();
        let update = OutboxUpdate::failed(id, "sink unavailable");

        assert_eq!(update.id, id);
        assert_eq!(update.error.as_deref(), Some("sink unavailable"));
    }
}
