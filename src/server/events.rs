//! Session lifecycle events
//!
//! A fixed set of event kinds with a registration table populated once at
//! startup and dispatched directly. Handlers run in registration order on
//! the thread that triggered the event; long work should be spawned.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::server::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A session was created and registered.
    Opened,
    /// A session transitioned to closed.
    Closed,
}

pub type EventHandler = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Maps each event kind to its ordered handler list.
#[derive(Default)]
pub struct EventRegistry {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `kind`. Registration happens during startup,
    /// before traffic is served.
    pub fn on(&self, kind: EventKind, handler: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        self.handlers.write().entry(kind).or_default().push(Box::new(handler));
    }

    pub fn dispatch(&self, kind: EventKind, session: &Arc<Session>) {
        let handlers = self.handlers.read();
        if let Some(handlers) = handlers.get(&kind) {
            for handler in handlers {
                handler(session);
            }
        }
    }
}
