use std::sync::Arc;

use async_trait::async_trait;

use super::envelope::Envelope;
use crate::contracts::ProcessingOutcome;

/// Processes task messages for the actions it claims.
///
/// `can_handle` must be pure: the consumer calls it for every registered
/// handler, in registration order, until one returns `true`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, action: &str) -> bool;

    /// An `Err` drops the message without requeue. Return
    /// `Ok(ProcessingOutcome::Retry)` to have it redelivered.
    async fn handle(&self, envelope: &Envelope) -> Result<ProcessingOutcome, HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Ordered handler set with first-match-wins lookup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    pub fn find(&self, action: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.iter().find(|handler| handler.can_handle(action))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticHandler {
        name: &'static str,
        actions: &'static [&'static str],
    }

    #[async_trait]
    impl MessageHandler for StaticHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, action: &str) -> bool {
            self.actions.contains(&action)
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<ProcessingOutcome, HandlerError> {
            Ok(ProcessingOutcome::Success)
        }
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(StaticHandler {
            name: "h1",
            actions: &["x"],
        }));
        registry.register(Arc::new(StaticHandler {
            name: "h2",
            actions: &["x", "y"],
        }));
        registry
    }

    #[test]
    fn test_first_match_wins() {
        let registry = registry();
        assert_eq!(registry.find("x").map(|h| h.name()), Some("h1"));
        assert_eq!(registry.find("y").map(|h| h.name()), Some("h2"));
        assert!(registry.find("z").is_none());
    }

    #[test]
    fn test_registration_order_preserved() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["h1", "h2"]);
        assert!(HandlerRegistry::new().is_empty());
    }
}
