use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::stream::{
    error::{BoxError, Error, Result},
    types::DecodedEnvelope,
};

/// What a record handler returns; any error type converts with `?`
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Type alias for record handler functions
///
/// Handlers are async functions that take a decoded envelope and return a result.
pub type MessageHandler<K, V> = Arc<
    dyn Fn(DecodedEnvelope<K, V>) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>>
        + Send
        + Sync,
>;

/// Holds the single callback a consumer dispatches to
///
/// A pure dispatch table: no retries, no timeouts. Those belong to the loop.
pub struct HandlerRegistry<K, V> {
    handler: Option<MessageHandler<K, V>>,
}

impl<K, V> Default for HandlerRegistry<K, V> {
    fn default() -> Self {
        Self { handler: None }
    }
}

impl<K, V> HandlerRegistry<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler
    ///
    /// # Errors
    ///
    /// `Error::Validation` when a handler is already registered.
    ///
    /// # Example
    ///
    /// ```
    /// use consumer_pipeline::stream::consumer::HandlerRegistry;
    ///
    /// let mut registry: HandlerRegistry<i64, String> = HandlerRegistry::new();
    /// registry
    ///     .register(|envelope| async move {
    ///         println!("payload = {}", envelope.value());
    ///         Ok(())
    ///     })
    ///     .unwrap();
    ///
    /// assert!(registry.register(|_| async { Ok(()) }).is_err());
    /// ```
    pub fn register<F, Fut>(&mut self, handler: F) -> Result<()>
    where
        F: Fn(DecodedEnvelope<K, V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.handler.is_some() {
            return Err(Error::Validation(
                "a record handler is already registered".to_string(),
            ));
        }

        self.handler = Some(Arc::new(move |envelope| Box::pin(handler(envelope))));
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.handler.is_some()
    }

    /// Run the handler on one envelope
    ///
    /// Handler failures come back as `Error::Handler`.
    pub async fn invoke(&self, envelope: DecodedEnvelope<K, V>) -> Result<()> {
        let handler = self
            .handler
            .as_ref()
            .ok_or_else(|| Error::Validation("no record handler registered".to_string()))?;

        handler(envelope).await.map_err(Error::handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::{Headers, RawRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(value: &str) -> DecodedEnvelope<i64, String> {
        let record = RawRecord {
            topic: "notifications".to_string(),
            partition: 0,
            offset: 1,
            key: None,
            value: None,
            headers: Headers::new(),
            timestamp: None,
        };
        DecodedEnvelope::new(record, Some(1), value.to_string(), 1)
    }

    #[tokio::test]
    async fn test_invoke_registered_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = HandlerRegistry::new();
        registry
            .register(move |envelope: DecodedEnvelope<i64, String>| {
                let counter = Arc::clone(&counter);
                async move {
                    assert_eq!(envelope.value(), "hello");
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        registry.invoke(envelope("hello")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_handler_error() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(|_: DecodedEnvelope<i64, String>| async { Err("downstream unavailable".into()) })
            .unwrap();

        let err = registry.invoke(envelope("x")).await.unwrap_err();
        assert!(matches!(err, Error::Handler(ref msg) if msg == "downstream unavailable"));
    }

    #[tokio::test]
    async fn test_invoke_without_handler() {
        let registry: HandlerRegistry<i64, String> = HandlerRegistry::new();
        assert!(!registry.is_registered());
        assert!(matches!(
            registry.invoke(envelope("x")).await,
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_second_registration_is_rejected() {
        let mut registry: HandlerRegistry<i64, String> = HandlerRegistry::new();
        registry.register(|_| async { Ok(()) }).unwrap();
        let err = registry.register(|_| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
