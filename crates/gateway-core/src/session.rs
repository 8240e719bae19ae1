use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::backend::{CryptoBackend, SessionContext};
use crate::error::LifecycleError;

/// Opaque caller-identity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(u64);

impl CallerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the host hands over when a caller context comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub id: CallerId,
    pub origin: Option<String>,
}

impl CallerContext {
    pub fn new(id: CallerId) -> Self {
        Self { id, origin: None }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub trait TeardownListener: Send + Sync {
    fn on_teardown(&self, caller: CallerId);
}

/// Source of caller-teardown signals.
pub trait TeardownSource: Send + Sync {
    /// Registers `listener` on behalf of `caller`. Fails if another live
    /// listener already holds `caller`.
    fn subscribe(
        &self,
        caller: CallerId,
        listener: Weak<dyn TeardownListener>,
    ) -> Result<SubscriptionId, LifecycleError>;

    /// Returns false if `id` was not registered.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

struct Subscription {
    caller: CallerId,
    listener: Weak<dyn TeardownListener>,
}

/// In-process teardown hub. Broadcasts each signal to every live listener.
#[derive(Default)]
pub struct TeardownSignals {
    inner: Mutex<SignalRegistry>,
}

#[derive(Default)]
struct SignalRegistry {
    next_id: u64,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl TeardownSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a teardown signal for `caller`. Returns how many listeners
    /// heard it.
    pub fn signal(&self, caller: CallerId) -> usize {
        let listeners: Vec<Arc<dyn TeardownListener>> = {
            let registry = self.inner.lock();
            registry
                .subscriptions
                .values()
                .filter_map(|s| s.listener.upgrade())
                .collect()
        };
        debug!(%caller, listeners = listeners.len(), "teardown signal");
        for listener in &listeners {
            listener.on_teardown(caller);
        }
        listeners.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.listener.strong_count() > 0)
            .count()
    }
}

impl TeardownSource for TeardownSignals {
    fn subscribe(
        &self,
        caller: CallerId,
        listener: Weak<dyn TeardownListener>,
    ) -> Result<SubscriptionId, LifecycleError> {
        let mut registry = self.inner.lock();
        registry
            .subscriptions
            .retain(|_, s| s.listener.strong_count() > 0);
        if registry.subscriptions.values().any(|s| s.caller == caller) {
            return Err(LifecycleError::AlreadyActive(caller));
        }
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .subscriptions
            .insert(id, Subscription { caller, listener });
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lock().subscriptions.remove(&id).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Active,
    Terminated,
}

struct SessionState {
    phase: SessionPhase,
    backend: Option<Arc<dyn CryptoBackend>>,
    subscription: Option<SubscriptionId>,
}

/// One caller's session. Owns its backend exclusively.
pub struct Session {
    caller: CallerContext,
    active: Arc<AtomicBool>,
    teardown: Arc<dyn TeardownSource>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        caller: CallerContext,
        backend: Box<dyn CryptoBackend>,
        teardown: Arc<dyn TeardownSource>,
    ) -> Self {
        Self {
            caller,
            active: Arc::new(AtomicBool::new(false)),
            teardown,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Uninitialized,
                backend: Some(Arc::from(backend)),
                subscription: None,
            }),
        }
    }

    pub fn caller(&self) -> CallerId {
        self.caller.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn context(&self) -> SessionContext {
        SessionContext::new(self.caller.id, self.active.clone())
    }

    /// `Uninitialized -> Active`, subscribing `listener` for teardown.
    pub fn activate(&self, listener: Weak<dyn TeardownListener>) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        match state.phase {
            SessionPhase::Uninitialized => {}
            SessionPhase::Active => return Ok(()),
            SessionPhase::Terminated => return Err(LifecycleError::Terminated),
        }
        let subscription = self.teardown.subscribe(self.caller.id, listener)?;
        state.subscription = Some(subscription);
        state.phase = SessionPhase::Active;
        self.active.store(true, Ordering::Release);
        info!(caller = %self.caller.id, origin = ?self.caller.origin, "session active");
        Ok(())
    }

    /// The backend, if the session is active.
    pub fn backend(&self) -> Result<Arc<dyn CryptoBackend>, LifecycleError> {
        let state = self.state.lock();
        match (state.phase, &state.backend) {
            (SessionPhase::Active, Some(backend)) => Ok(backend.clone()),
            (SessionPhase::Uninitialized, _) => Err(LifecycleError::NotActive),
            _ => Err(LifecycleError::Terminated),
        }
    }

    /// Moves to `Terminated`: shuts the backend down, releases it and
    /// deregisters from the teardown source. Only the first call does
    /// anything; it returns true.
    pub fn terminate(&self) -> bool {
        let (backend, subscription) = {
            let mut state = self.state.lock();
            if state.phase == SessionPhase::Terminated {
                return false;
            }
            state.phase = SessionPhase::Terminated;
            self.active.store(false, Ordering::Release);
            (state.backend.take(), state.subscription.take())
        };
        if let Some(backend) = backend {
            backend.shutdown();
        }
        if let Some(id) = subscription {
            self.teardown.unsubscribe(id);
        }
        info!(caller = %self.caller.id, "session terminated");
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();
    }
}
