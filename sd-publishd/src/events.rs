use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// An event raised on an [`EventBus`]. `kind` names the channel it is delivered on.
pub trait Event {
    type Kind: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

type Handler<E> = Box<dyn Fn(&E) + Send + Sync>;

/// Synchronous publish/subscribe, owned by the component that raises the events.
///
/// Handlers run on the publishing task, in subscription order. A panicking
/// handler unwinds into the publisher; handlers are expected not to panic.
pub struct EventBus<E: Event> {
    handlers: HashMap<E::Kind, Vec<Handler<E>>>,
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn subscribe<F>(&mut self, kind: E::Kind, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn publish(&self, event: &E) {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            tracing::trace!("No subscribers for {:?}", event.kind());
            return;
        };
        for handler in handlers {
            handler(event);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<E::Kind, usize> =
            self.handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}
