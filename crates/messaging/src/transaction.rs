//! Unit of work around a single receive/dispatch cycle.
//!
//! Transports and pipeline steps enlist work in the context instead of performing it
//! immediately: outgoing sends run on commit, a received message is handed back to its
//! queue on abort. Whoever owns the context (the worker, or the bus for calls made
//! outside a handler) decides how it ends.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;

use courier_core::BusResult;

type CommitCallback = Box<dyn FnOnce() -> BoxFuture<'static, BusResult<()>> + Send>;
type Callback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    Aborted,
}

/// Transaction context shared by the transport and every pipeline step.
///
/// A context ends exactly once. After a successful commit, `abort` is a no-op and
/// vice versa. A commit whose callbacks fail leaves the context open so the caller
/// can still abort it.
pub struct TransactionContext {
    state: Mutex<TxState>,
    on_committed: Mutex<Vec<CommitCallback>>,
    on_aborted: Mutex<Vec<Callback>>,
    on_completed: Mutex<Vec<Callback>>,
    items: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl core::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("state", &*lock(&self.state))
            .field("items", &lock(&self.items).keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every critical section here is a single push/take, so a panic elsewhere
    // cannot leave the data half-updated.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransactionContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TxState::Open),
            on_committed: Mutex::new(Vec::new()),
            on_aborted: Mutex::new(Vec::new()),
            on_completed: Mutex::new(Vec::new()),
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.state) == TxState::Open
    }

    pub fn is_committed(&self) -> bool {
        *lock(&self.state) == TxState::Committed
    }

    pub fn is_aborted(&self) -> bool {
        *lock(&self.state) == TxState::Aborted
    }

    /// Enlist work that must only happen if the unit of work commits.
    pub fn on_committed<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = BusResult<()>> + Send + 'static,
    {
        let callback: CommitCallback = Box::new(move || callback().boxed());
        lock(&self.on_committed).push(callback);
    }

    /// Enlist compensation that runs if the unit of work aborts.
    pub fn on_aborted<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Box::new(move || callback().boxed());
        lock(&self.on_aborted).push(callback);
    }

    /// Enlist work that runs after either outcome.
    pub fn on_completed<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Box::new(move || callback().boxed());
        lock(&self.on_completed).push(callback);
    }

    /// Run all commit callbacks in registration order.
    ///
    /// Callbacks may enlist further callbacks; those run in the same commit.
    pub async fn commit(&self) -> BusResult<()> {
        if !self.is_open() {
            return Ok(());
        }

        loop {
            let callbacks = std::mem::take(&mut *lock(&self.on_committed));
            if callbacks.is_empty() {
                break;
            }
            for callback in callbacks {
                callback().await?;
            }
        }

        {
            let mut state = lock(&self.state);
            if *state != TxState::Open {
                return Ok(());
            }
            *state = TxState::Committed;
        }

        lock(&self.on_aborted).clear();
        self.run_completed().await;
        Ok(())
    }

    /// Run all abort callbacks. No-op once the context has ended.
    pub async fn abort(&self) {
        {
            let mut state = lock(&self.state);
            if *state != TxState::Open {
                return;
            }
            *state = TxState::Aborted;
        }

        lock(&self.on_committed).clear();
        let callbacks = std::mem::take(&mut *lock(&self.on_aborted));
        for callback in callbacks {
            callback().await;
        }
        self.run_completed().await;
    }

    /// Commit the context if nobody has ended it yet.
    pub async fn complete(&self) -> BusResult<()> {
        self.commit().await
    }

    async fn run_completed(&self) {
        let callbacks = std::mem::take(&mut *lock(&self.on_completed));
        for callback in callbacks {
            callback().await;
        }
    }

    /// Store a value in the context's item bag, replacing any previous value.
    pub fn set_item<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        lock(&self.items).insert(key.into(), Arc::new(value));
    }

    /// Fetch a clone of a stored value, if present and of type `T`.
    pub fn item<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        let items = lock(&self.items);
        items.get(key)?.downcast_ref::<T>().cloned()
    }

    pub fn has_item(&self, key: &str) -> bool {
        lock(&self.items).contains_key(key)
    }

    pub fn remove_item(&self, key: &str) -> bool {
        lock(&self.items).remove(key).is_some()
    }
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}
