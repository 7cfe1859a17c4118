//! Single-fire reply futures and the registry that hands them out.
//!
//! A request sender creates a [`Future`] through a [`FutureManager`], ships
//! the id with the request and waits in [`Future::get_result`]. The inbound
//! path looks the id up and calls [`Future::set_result`]. Whichever of
//! `set_result` and `cancel` runs first wins; the other is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FutureError {
    #[error("timed out waiting for the result")]
    Timeout,
    #[error("result channel closed")]
    ChannelClosed,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

type CancelCallback = Box<dyn Fn(u64) + Send + Sync>;

pub struct Future<T> {
    id: u64,
    finished: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<T>>>,
    receiver: Mutex<Option<oneshot::Receiver<T>>>,
    cancel_callback: CancelCallback,
}

impl<T: Send> Future<T> {
    pub fn new<F>(id: u64, cancel_callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        Self {
            id,
            finished: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            cancel_callback: Box::new(cancel_callback),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Delivers the result. Returns `false` if the future already finished.
    pub fn set_result(&self, result: T) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(tx) = lock(&self.sender).take() {
            // The waiter may already be gone; nothing to do then.
            let _ = tx.send(result);
        }
        self.finish();
        true
    }

    /// Closes the result channel without a value. Returns `false` if the
    /// future already finished.
    pub fn cancel(&self) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        lock(&self.sender).take();
        self.finish();
        true
    }

    fn finish(&self) {
        (self.cancel_callback)(self.id);
    }

    /// Waits for the result for at most `duration`, cancelling on timeout.
    /// Only the first caller can receive a value.
    pub async fn get_result(&self, duration: Duration) -> Result<T, FutureError> {
        let receiver = lock(&self.receiver).take();
        let Some(receiver) = receiver else {
            return Err(FutureError::ChannelClosed);
        };
        match tokio::time::timeout(duration, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(FutureError::ChannelClosed),
            Err(_) => {
                self.cancel();
                Err(FutureError::Timeout)
            }
        }
    }
}

/// Registry of pending futures. Constructed per server instance and shared
/// by reference; finished futures remove themselves.
pub struct FutureManager<T> {
    futures: Arc<Mutex<HashMap<u64, Arc<Future<T>>>>>,
    index: AtomicU64,
}

impl<T: Send + 'static> FutureManager<T> {
    pub fn new() -> Self {
        Self {
            futures: Arc::new(Mutex::new(HashMap::new())),
            index: AtomicU64::new(1),
        }
    }

    pub fn create(&self) -> Arc<Future<T>> {
        let id = self.index.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(&self.futures);
        let future = Arc::new(Future::new(id, move |id| {
            if let Some(registry) = registry.upgrade() {
                lock(&registry).remove(&id);
            }
        }));
        lock(&self.futures).insert(id, Arc::clone(&future));
        future
    }

    pub fn get(&self, id: u64) -> Option<Arc<Future<T>>> {
        lock(&self.futures).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.futures).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Default for FutureManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_set_result_delivers_once() {
        let manager: FutureManager<String> = FutureManager::new();
        let future = manager.create();
        assert_eq!(manager.len(), 1);

        assert!(future.set_result("first".to_string()));
        assert!(!future.set_result("second".to_string()));
        assert!(!future.cancel());
        assert!(manager.is_empty(), "finished future should leave the registry");

        let result = future.get_result(Duration::from_millis(100)).await;
        assert_eq!(result, Ok("first".to_string()));
        // The value can only be taken once.
        let again = future.get_result(Duration::from_millis(10)).await;
        assert_eq!(again, Err(FutureError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_cancel_then_set_result() {
        let manager: FutureManager<u32> = FutureManager::new();
        let future = manager.create();
        assert!(future.cancel());
        assert!(!future.set_result(7));
        let result = future.get_result(Duration::from_millis(100)).await;
        assert_eq!(result, Err(FutureError::ChannelClosed));
        assert!(manager.get(future.id()).is_none());
    }

    #[tokio::test]
    async fn test_timeout_cancels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let future: Future<u32> = Future::new(1, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = future.get_result(Duration::from_millis(20)).await;
        assert_eq!(result, Err(FutureError::Timeout));
        assert!(future.is_finished());
        assert!(!future.set_result(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "cleanup callback must fire exactly once");
    }

    #[tokio::test]
    async fn test_result_from_another_task() {
        let manager: Arc<FutureManager<u64>> = Arc::new(FutureManager::new());
        let future = manager.create();
        let id = future.id();

        let m = Arc::clone(&manager);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(f) = m.get(id) {
                f.set_result(42);
            }
        });

        assert_eq!(future.get_result(Duration::from_secs(1)).await, Ok(42));
    }

    #[test]
    fn test_ids_are_unique() {
        let manager: FutureManager<()> = FutureManager::new();
        let a = manager.create();
        let b = manager.create();
        a.cancel();
        let c = manager.create();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_ne!(b.id(), c.id());
        assert_eq!(manager.len(), 2);
    }
}
