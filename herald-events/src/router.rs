//! Routing table from event type to handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{EventError, HandlerError, IntegrationEvent, Result};

/// Reacts to one type of integration event.
///
/// Handlers must be idempotent: a failure after the handler succeeded but
/// before the dedup record was written makes the broker redeliver.
#[async_trait]
pub trait IntegrationEventHandler: Send + Sync {
    /// Stable name, part of the dedup key. Renaming a handler makes it
    /// reprocess everything still retained by the broker.
    fn name(&self) -> &str;

    /// Handle one event. `message_id` is the event id.
    async fn handle(
        &self,
        event: &IntegrationEvent,
        message_id: &str,
    ) -> std::result::Result<(), HandlerError>;
}

/// Closure-based handler.
///
/// ```rust,ignore
/// let handler = FnEventHandler::new("welcome-email", |event: IntegrationEvent, _id: String| {
///     async move { send_welcome(event.payload_as::<UserCreated>()?).await }
/// });
/// ```
pub struct FnEventHandler<F> {
    name: String,
    f: F,
}

impl<F> FnEventHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> IntegrationEventHandler for FnEventHandler<F>
where
    F: Fn(IntegrationEvent, String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        event: &IntegrationEvent,
        message_id: &str,
    ) -> std::result::Result<(), HandlerError> {
        (self.f)(event.clone(), message_id.to_string()).await
    }
}

/// Builds an [`EventRouter`] at startup.
#[derive(Default)]
pub struct EventRouterBuilder {
    routes: HashMap<String, Arc<dyn IntegrationEventHandler>>,
}

impl EventRouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `event_type` to `handler`.
    ///
    /// Fails with [`EventError::DuplicateHandler`] when the type already has
    /// a handler.
    pub fn register<H>(self, event_type: impl Into<String>, handler: H) -> Result<Self>
    where
        H: IntegrationEventHandler + 'static,
    {
        self.register_shared(event_type, Arc::new(handler))
    }

    /// Route `event_type` to a shared handler.
    pub fn register_shared(
        mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn IntegrationEventHandler>,
    ) -> Result<Self> {
        let event_type = event_type.into();
        if let Some(existing) = self.routes.get(&event_type) {
            return Err(EventError::DuplicateHandler {
                event_type,
                existing: existing.name().to_string(),
            });
        }

        info!(
            event_type = %event_type,
            handler = handler.name(),
            "Registered integration event handler"
        );
        self.routes.insert(event_type, handler);
        Ok(self)
    }

    pub fn build(self) -> EventRouter {
        EventRouter {
            routes: Arc::new(self.routes),
        }
    }
}

/// Immutable routing table. Cheap to clone.
#[derive(Clone)]
pub struct EventRouter {
    routes: Arc<HashMap<String, Arc<dyn IntegrationEventHandler>>>,
}

impl EventRouter {
    pub fn builder() -> EventRouterBuilder {
        EventRouterBuilder::new()
    }

    /// Handler for `event_type`.
    pub fn resolve(&self, event_type: &str) -> Result<&Arc<dyn IntegrationEventHandler>> {
        self.routes
            .get(event_type)
            .ok_or_else(|| EventError::UnregisteredEventType {
                event_type: event_type.to_string(),
            })
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: Vec<(&str, &str)> = self
            .event_types()
            .into_iter()
            .filter_map(|t| self.routes.get(t).map(|h| (t, h.name())))
            .collect();
        f.debug_struct("EventRouter").field("routes", &routes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop(&'static str);

    #[async_trait]
    impl IntegrationEventHandler for Noop {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(
            &self,
            _event: &IntegrationEvent,
            _message_id: &str,
        ) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = EventRouter::builder()
            .register("UserCreated", Noop("welcome-email"))
            .unwrap()
            .register("UserCreated", Noop("audit"));

        match result {
            Err(EventError::DuplicateHandler { event_type, existing }) => {
                assert_eq!(event_type, "UserCreated");
                assert_eq!(existing, "welcome-email");
            }
            _ => panic!("expected DuplicateHandler"),
        }
    }

    #[test]
    fn test_resolve() {
        let router = EventRouter::builder()
            .register("UserCreated", Noop("welcome-email"))
            .unwrap()
            .register("UserDeleted", Noop("cleanup"))
            .unwrap()
            .build();

        assert_eq!(router.len(), 2);
        assert_eq!(router.event_types(), vec!["UserCreated", "UserDeleted"]);
        assert_eq!(router.resolve("UserDeleted").unwrap().name(), "cleanup");
        assert!(matches!(
            router.resolve("OrderPlaced"),
            Err(EventError::UnregisteredEventType { event_type }) if event_type == "OrderPlaced"
        ));
    }

    #[tokio::test]
    async fn test_fn_handler_receives_event_and_id() {
        let handler = FnEventHandler::new("echo", |event: IntegrationEvent, id: String| async move {
            if event.id() == id {
                Ok(())
            } else {
                Err(HandlerError::failed("id mismatch"))
            }
        });

        let event = IntegrationEvent::new("UserCreated", json!({}), "users");
        let id = event.id().to_string();
        assert!(handler.handle(&event, &id).await.is_ok());
        assert!(handler.handle(&event, "other").await.is_err());
        assert_eq!(handler.name(), "echo");
    }
}
