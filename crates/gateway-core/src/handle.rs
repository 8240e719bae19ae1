use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{BackendError, OperationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Pending,
    Succeeded,
    Failed,
}

type SuccessFn<T> = Box<dyn FnOnce(&T) + Send>;
type FailureFn = Box<dyn FnOnce(&OperationError) + Send>;

enum Observer<T> {
    Success(SuccessFn<T>),
    Failure(FailureFn),
}

impl<T> Observer<T> {
    fn deliver(self, outcome: &Result<Arc<T>, OperationError>) {
        match (self, outcome) {
            (Observer::Success(f), Ok(value)) => f(&**value),
            (Observer::Failure(f), Err(err)) => f(err),
            _ => {}
        }
    }
}

enum Outcome<T> {
    Pending,
    Succeeded(Arc<T>),
    Failed(OperationError),
}

struct Slot<T> {
    outcome: Outcome<T>,
    queue: VecDeque<Observer<T>>,
    draining: bool,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                outcome: Outcome::Pending,
                queue: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Returns false when the slot was already terminal.
    fn settle(&self, outcome: Outcome<T>) -> bool {
        {
            let mut slot = self.slot.lock();
            if !matches!(slot.outcome, Outcome::Pending) {
                return false;
            }
            slot.outcome = outcome;
        }
        self.drain();
        true
    }

    fn observe(&self, observer: Observer<T>) {
        self.slot.lock().queue.push_back(observer);
        self.drain();
    }

    fn drain(&self) {
        let mut slot = self.slot.lock();
        // An observer registered while another thread (or an outer observer)
        // is delivering lands in the queue and is picked up by that loop.
        if slot.draining {
            return;
        }
        let outcome = match &slot.outcome {
            Outcome::Pending => return,
            Outcome::Succeeded(value) => Ok(value.clone()),
            Outcome::Failed(err) => Err(err.clone()),
        };
        slot.draining = true;
        while let Some(observer) = slot.queue.pop_front() {
            let delivered = MutexGuard::unlocked(&mut slot, || {
                panic::catch_unwind(AssertUnwindSafe(|| observer.deliver(&outcome)))
            });
            if delivered.is_err() {
                warn!("result observer panicked; continuing with the next one");
            }
        }
        slot.draining = false;
    }

    fn state(&self) -> HandleState {
        match self.slot.lock().outcome {
            Outcome::Pending => HandleState::Pending,
            Outcome::Succeeded(_) => HandleState::Succeeded,
            Outcome::Failed(_) => HandleState::Failed,
        }
    }
}

/// Caller half of a pending operation.
///
/// Moves `Pending -> Succeeded | Failed` once. Observers run in registration
/// order, outside the lock, exactly once each; a panicking observer is logged
/// and skipped.
pub struct ResultHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl<T> ResultHandle<T> {
    /// Creates a pending handle and the resolver that completes it.
    pub fn pending() -> (ResultHandle<T>, Resolver<T>) {
        let shared = Arc::new(Shared::new());
        let resolver = Resolver {
            guard: Arc::new(ResolverGuard {
                shared: shared.clone(),
            }),
        };
        (ResultHandle { shared }, resolver)
    }

    /// A handle that is already Failed. Used for rejections decided at the
    /// boundary.
    pub fn failed(err: impl Into<OperationError>) -> ResultHandle<T> {
        let shared = Arc::new(Shared::new());
        shared.settle(Outcome::Failed(err.into()));
        ResultHandle { shared }
    }

    pub fn state(&self) -> HandleState {
        self.shared.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == HandleState::Pending
    }

    /// Runs `observer` with the success payload. Immediate if the handle has
    /// already succeeded.
    pub fn on_success<F>(&self, observer: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.shared.observe(Observer::Success(Box::new(observer)));
        self
    }

    /// Runs `observer` with the failure payload. Immediate if the handle has
    /// already failed.
    pub fn on_failure<F>(&self, observer: F) -> &Self
    where
        F: FnOnce(&OperationError) + Send + 'static,
    {
        self.shared.observe(Observer::Failure(Box::new(observer)));
        self
    }

    /// Snapshot of the terminal outcome, `None` while pending.
    pub fn outcome(&self) -> Option<Result<Arc<T>, OperationError>> {
        match &self.shared.slot.lock().outcome {
            Outcome::Pending => None,
            Outcome::Succeeded(value) => Some(Ok(value.clone())),
            Outcome::Failed(err) => Some(Err(err.clone())),
        }
    }
}

impl<T> ResultHandle<T>
where
    T: Send + Sync + 'static,
{
    /// Derives a handle whose success payload is `f` applied to this one's.
    /// Failures pass through unchanged.
    pub fn map<U, F>(&self, f: F) -> ResultHandle<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let (mapped, resolver) = ResultHandle::pending();
        let on_err = resolver.clone();
        self.on_success(move |value| {
            resolver.resolve(f(value));
        });
        self.on_failure(move |err| {
            on_err.reject(err.clone());
        });
        mapped
    }

    /// Waits for the terminal transition without blocking a thread.
    pub async fn completion(&self) -> Result<Arc<T>, OperationError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_err = tx.clone();
        self.shared.observe(Observer::Success(Box::new(move |_: &T| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        })));
        self.shared.observe(Observer::Failure(Box::new(move |_: &OperationError| {
            if let Some(tx) = tx_err.lock().take() {
                let _ = tx.send(());
            }
        })));
        match rx.await {
            Ok(()) => self
                .outcome()
                .unwrap_or_else(|| Err(BackendError::abandoned().into())),
            Err(_) => Err(BackendError::abandoned().into()),
        }
    }
}

/// Backend half of a pending operation. Clones share one slot; once the last
/// clone is dropped a still-pending handle fails as abandoned.
pub struct Resolver<T> {
    guard: Arc<ResolverGuard<T>>,
}

struct ResolverGuard<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for ResolverGuard<T> {
    fn drop(&mut self) {
        if self
            .shared
            .settle(Outcome::Failed(BackendError::abandoned().into()))
        {
            warn!("pending operation dropped by backend without completion");
        }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("state", &self.guard.shared.state())
            .finish()
    }
}

impl<T> Resolver<T> {
    /// Pending -> Succeeded. Returns false (and does nothing) if the handle
    /// was already terminal.
    pub fn resolve(&self, value: T) -> bool {
        self.guard
            .shared
            .settle(Outcome::Succeeded(Arc::new(value)))
    }

    /// Pending -> Failed. Returns false (and does nothing) if the handle was
    /// already terminal.
    pub fn reject(&self, err: impl Into<OperationError>) -> bool {
        self.guard.shared.settle(Outcome::Failed(err.into()))
    }
}
