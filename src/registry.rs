//! Type registry: resolving a record's type tag to a payload decoder.
//!
//! The registry replaces runtime type discovery with an explicit catalog of
//! decoders keyed by tag, populated once at startup. Resolution results are
//! memoized so repeated tags skip the catalog lookup entirely.
//!
//! ## Components
//!
//! - [`DecoderCatalog`]: Trait for the (potentially costly) decoder source
//! - [`StaticCatalog`]: Catalog built from a fixed table at startup
//! - [`TypeRegistry`]: Memoizing resolver, safe under concurrent callers
//!
//! An unresolvable tag yields [`UnknownTypeError`]; the delivery fan-out
//! records it as a per-record failure rather than aborting the batch.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, de::DeserializeOwned};

/// Decoder turning a record's raw `content` into the host payload type `P`.
pub type Decoder<P> =
    Arc<dyn Fn(&serde_json::Value) -> Result<P, tower::BoxError> + Send + Sync>;

/// Source of decoders, looked up by type tag.
///
/// Implementations may perform costly work per lookup (schema catalogs,
/// composed decoder construction); [`TypeRegistry`] caches whatever they
/// return, so a lookup runs at most a handful of times per tag.
pub trait DecoderCatalog<P> {
    /// Look up the decoder for a type tag, or `None` when unknown.
    fn lookup(&self, type_name: &str) -> Option<Decoder<P>>;
}

/// Catalog populated from a fixed table at startup.
pub struct StaticCatalog<P> {
    decoders: HashMap<String, Decoder<P>>,
}

impl<P> Default for StaticCatalog<P> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<P> StaticCatalog<P> {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder closure for a type tag.
    pub fn with_decoder<F>(mut self, type_name: impl Into<String>, decoder: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<P, tower::BoxError> + Send + Sync + 'static,
    {
        self.decoders.insert(type_name.into(), Arc::new(decoder));
        self
    }

    /// Register a JSON decoder for a type deserializable with `serde`.
    ///
    /// The decoded value is converted into the payload type via `From`.
    pub fn with_json<T>(self, type_name: impl Into<String>) -> Self
    where
        T: DeserializeOwned,
        P: From<T>,
    {
        self.with_decoder(type_name, |content| {
            let decoded = T::deserialize(content)?;
            Ok(P::from(decoded))
        })
    }
}

impl<P> DecoderCatalog<P> for StaticCatalog<P> {
    fn lookup(&self, type_name: &str) -> Option<Decoder<P>> {
        self.decoders.get(type_name).map(Arc::clone)
    }
}

/// Memoizing decoder resolver.
///
/// The cache is the one piece of state shared across cycles and across the
/// concurrent fan-out units within a cycle. Concurrent first resolutions of
/// the same tag may duplicate the catalog lookup, but only one entry per tag
/// ever lands in the cache (first writer wins).
pub struct TypeRegistry<P, C = StaticCatalog<P>> {
    catalog: C,
    cache: RwLock<HashMap<String, Decoder<P>>>,
}

impl<P, C> TypeRegistry<P, C>
where
    C: DecoderCatalog<P>,
{
    /// Create a registry over a decoder catalog.
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the decoder for a type tag, consulting the cache first.
    pub fn resolve(&self, type_name: &str) -> Result<Decoder<P>, UnknownTypeError> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(decoder) = cache.get(type_name) {
                return Ok(Arc::clone(decoder));
            }
        }

        let decoder = self
            .catalog
            .lookup(type_name)
            .ok_or_else(|| UnknownTypeError::new(type_name))?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let decoder = cache
            .entry(type_name.to_owned())
            .or_insert(decoder);

        Ok(Arc::clone(decoder))
    }
}

/// Error returned when a type tag has no registered decoder.
#[derive(Debug)]
pub struct UnknownTypeError {
    type_name: String,
}

impl UnknownTypeError {
    fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_owned(),
        }
    }

    /// The unresolvable tag.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

impl std::fmt::Display for UnknownTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "No decoder registered for type '{}'", self.type_name)
    }
}

impl std::error::Error for UnknownTypeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: u64,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Order(OrderPlaced),
    }

    impl From<OrderPlaced> for Event {
        fn from(value: OrderPlaced) -> Self {
            Event::Order(value)
        }
    }

    fn registry() -> TypeRegistry<Event> {
        TypeRegistry::new(StaticCatalog::new().with_json::<OrderPlaced>("orders.placed"))
    }

    #[test]
    fn resolves_registered_tag_and_decodes() {
        let registry = registry();
        let content = serde_json::to_value(OrderPlaced { order_id: 7 }).unwrap();

        let decoder = registry.resolve("orders.placed").unwrap();
        let event = decoder(&content).unwrap();

        assert_eq!(event, Event::Order(OrderPlaced { order_id: 7 }));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = registry();

        let err = registry.resolve("orders.cancelled").err().unwrap();

        assert_eq!(err.type_name(), "orders.cancelled");
    }

    #[test]
    fn decoded_payload_round_trips() {
        let registry = registry();
        let original = OrderPlaced { order_id: 42 };
        let content = serde_json::to_value(&original).unwrap();

        let decoder = registry.resolve("orders.placed").unwrap();

        assert_eq!(decoder(&content).unwrap(), Event::Order(original));
    }

    struct CountingCatalog {
        inner: StaticCatalog<Event>,
        lookups: AtomicUsize,
    }

    impl DecoderCatalog<Event> for CountingCatalog {
        fn lookup(&self, type_name: &str) -> Option<Decoder<Event>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(type_name)
        }
    }

    #[test]
    fn resolution_is_memoized() {
        let registry = TypeRegistry::new(CountingCatalog {
            inner: StaticCatalog::new().with_json::<OrderPlaced>("orders.placed"),
            lookups: AtomicUsize::new(0),
        });

        registry.resolve("orders.placed").unwrap();
        registry.resolve("orders.placed").unwrap();
        registry.resolve("orders.placed").unwrap();

        assert_eq!(registry.catalog.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_resolution_does_not_corrupt_the_cache() {
        let registry = Arc::new(TypeRegistry::new(CountingCatalog {
            inner: StaticCatalog::new().with_json::<OrderPlaced>("orders.placed"),
            lookups: AtomicUsize::new(0),
        }));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.resolve("orders.placed").map(|_| ()) })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Duplicate lookups are allowed while the cache is cold, but the
        // cache settles on a single entry and stops consulting the catalog.
        let warm = registry.catalog.lookups.load(Ordering::SeqCst);
        registry.resolve("orders.placed").unwrap();
        assert_eq!(registry.catalog.lookups.load(Ordering::SeqCst), warm);
        assert_eq!(
            registry
                .cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            1
        );
    }
}
