//! Session registry
//!
//! Concurrent keyed store of live sessions, indexed by session id and by
//! principal. Creation is an atomic insert-if-absent that fails loudly on a
//! duplicate id. A background sweep closes sessions idle beyond the
//! inactivity threshold; removal after close is deferred by a short grace
//! window so a reconnect racing the close still finds the session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::security::SecurityContext;
use crate::server::events::{EventKind, EventRegistry};
use crate::server::session::{Session, SessionError};

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    by_principal: DashMap<String, HashSet<String>>,
    events: Arc<EventRegistry>,
    /// Inactivity threshold for both the sweep and flush-time staleness.
    timeout: Duration,
    /// How long a closed-but-fresh session entry lingers before removal.
    grace: Duration,
}

impl SessionRegistry {
    pub fn new(events: Arc<EventRegistry>, timeout: Duration, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            by_principal: DashMap::new(),
            events,
            timeout,
            grace,
        })
    }

    /// Create and register a session. A duplicate id is a contract
    /// violation, not a lookup.
    pub fn create(
        self: &Arc<Self>,
        id: &str,
        ctx: SecurityContext,
    ) -> Result<Arc<Session>, SessionError> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => Err(SessionError::SessionExists(id.to_string())),
            Entry::Vacant(entry) => {
                let session = Session::new(
                    id,
                    ctx,
                    self.timeout,
                    self.events.clone(),
                    Arc::downgrade(self),
                );
                entry.insert(session.clone());
                if let Some(principal) = session.security_context().principal_name() {
                    self.by_principal
                        .entry(principal.to_string())
                        .or_default()
                        .insert(id.to_string());
                }
                debug!(session = %id, "session created");
                self.events.dispatch(EventKind::Opened, &session);
                Ok(session)
            }
        }
    }

    /// Resolve an existing session or create one. The boolean reports
    /// whether this call created it; racing requests for the same id
    /// resolve to one winner.
    pub fn get_or_create(self: &Arc<Self>, id: &str, ctx: SecurityContext) -> (Arc<Session>, bool) {
        loop {
            if let Some(session) = self.get(id) {
                return (session, false);
            }
            match self.create(id, ctx.clone()) {
                Ok(session) => return (session, true),
                // lost the race; pick up the winner's session
                Err(_) => continue,
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// The lifecycle event registry shared with sessions.
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    /// All sessions owned by `principal`.
    pub fn sessions_for(&self, principal: &str) -> Vec<Arc<Session>> {
        let Some(ids) = self.by_principal.get(principal) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop a closed session's entry: immediately when it was already well
    /// past the threshold, otherwise after the grace window so a reconnect
    /// racing the close still resolves to this session.
    pub(crate) fn unregister(self: &Arc<Self>, session: &Arc<Session>) {
        let id = session.id().to_string();
        if session.idle_for() > self.timeout {
            debug!(session = %id, "removing session immediately");
            self.remove(&id);
            return;
        }

        let registry = self.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            debug!(session = %id, "removing session after grace window");
            registry.remove(&id);
        });
    }

    fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            if let Some(principal) = session.security_context().principal_name() {
                if let Some(mut ids) = self.by_principal.get_mut(principal) {
                    ids.remove(id);
                }
            }
        }
    }

    /// One sweep pass: close every open session idle beyond the threshold.
    pub fn sweep(&self) {
        // collect first; closing re-enters the map through unregister
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_open() && entry.value().is_stale())
            .map(|entry| entry.value().clone())
            .collect();

        if !stale.is_empty() {
            info!(count = stale.len(), "closing inactive sessions");
        }
        for session in stale {
            session.close();
        }
    }

    /// Run [`sweep`](Self::sweep) on a fixed period until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.sweep();
            }
        })
    }
}
