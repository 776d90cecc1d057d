//! A completable future with listeners.
//!
//! [`TxFuture`] is completed exactly once, either by the thread that finishes
//! a transaction or by a recovery callback. Callers may block on it or attach
//! listeners that run on the completing thread.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Listener<T> = Box<dyn FnOnce(&T) + Send>;

struct FutureState<T> {
    result: Option<T>,
    listeners: Vec<Listener<T>>,
}

struct Shared<T> {
    state: Mutex<FutureState<T>>,
    cv: Condvar,
}

pub struct TxFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TxFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for TxFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> TxFuture<T> {
    /// Create a pending future.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FutureState {
                    result: None,
                    listeners: Vec::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Create an already completed future.
    pub fn finished(value: T) -> Self {
        let fut = Self::new();
        fut.on_done(value);
        fut
    }

    /// Complete the future. Returns false if it was already completed, in
    /// which case `value` is dropped.
    pub fn on_done(&self, value: T) -> bool {
        let listeners = {
            let mut state = self.shared.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(value.clone());
            std::mem::take(&mut state.listeners)
        };
        self.shared.cv.notify_all();
        for listener in listeners {
            listener(&value);
        }
        true
    }

    /// Register a listener. It runs immediately on the calling thread if the
    /// future is already done.
    pub fn listen<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let done = {
            let mut state = self.shared.state.lock();
            match &state.result {
                Some(value) => value.clone(),
                None => {
                    state.listeners.push(Box::new(f));
                    return;
                }
            }
        };
        f(&done);
    }

    /// Returns a future completed with `f` applied to this future's result.
    pub fn chain<U, F>(&self, f: F) -> TxFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let next = TxFuture::new();
        let target = next.clone();
        self.listen(move |value| {
            target.on_done(f(value));
        });
        next
    }

    /// Block until the future completes.
    pub fn get(&self) -> T {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = &state.result {
                return value.clone();
            }
            self.shared.cv.wait(&mut state);
        }
    }

    /// Block until the future completes or `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = &state.result {
                return Some(value.clone());
            }
            if self.shared.cv.wait_until(&mut state, deadline).timed_out() {
                return state.result.clone();
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().result.is_some()
    }

    /// The result, if the future is done.
    pub fn result(&self) -> Option<T> {
        self.shared.state.lock().result.clone()
    }
}

impl<T> fmt::Debug for TxFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self.shared.state.lock().result.is_some();
        f.debug_struct("TxFuture").field("done", &done).finish()
    }
}

/// Returns a future that completes once every input future is done, with the
/// results in input order.
pub fn join_all<T>(futures: Vec<TxFuture<T>>) -> TxFuture<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let joined = TxFuture::new();
    if futures.is_empty() {
        joined.on_done(Vec::new());
        return joined;
    }

    let slots: Arc<Mutex<(Vec<Option<T>>, usize)>> =
        Arc::new(Mutex::new((vec![None; futures.len()], futures.len())));
    for (idx, fut) in futures.into_iter().enumerate() {
        let slots = slots.clone();
        let joined = joined.clone();
        fut.listen(move |value| {
            let complete = {
                let mut guard = slots.lock();
                guard.0[idx] = Some(value.clone());
                guard.1 -= 1;
                if guard.1 == 0 {
                    Some(guard.0.iter_mut().filter_map(Option::take).collect())
                } else {
                    None
                }
            };
            if let Some(results) = complete {
                joined.on_done(results);
            }
        });
    }
    joined
}
