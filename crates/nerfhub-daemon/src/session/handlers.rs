//! Message handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use nerfhub_proto::{MessageKind, ViewerMessage};

use super::types::SessionId;

/// Callback for one incoming message. Runs off the connection task.
pub type Handler = Arc<dyn Fn(SessionId, &ViewerMessage) -> anyhow::Result<()> + Send + Sync>;

/// Handlers keyed by message kind, kept in registration order.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Vec<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: MessageKind, handler: Handler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Handlers for `kind`, cloned so they can run without holding a lock.
    pub fn handlers_for(&self, kind: MessageKind) -> Vec<Handler> {
        self.handlers.get(&kind).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: Vec<_> = self
            .handlers
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        counts.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_are_returned_per_kind_in_order() {
        let mut registry = HandlerRegistry::new();
        let first: Handler = Arc::new(|_, _| Ok(()));
        let second: Handler = Arc::new(|_, _| anyhow::bail!("second"));
        registry.register(MessageKind::GuiUpdate, Arc::clone(&first));
        registry.register(MessageKind::GuiUpdate, Arc::clone(&second));

        let found = registry.handlers_for(MessageKind::GuiUpdate);
        assert_eq!(found.len(), 2);
        assert!(Arc::ptr_eq(&found[0], &first));
        assert!(Arc::ptr_eq(&found[1], &second));
        assert!(registry.handlers_for(MessageKind::PositionUpdate).is_empty());
        assert_eq!(registry.len(), 2);
    }
}
