use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

#[must_use = "dropping a CancelHandle cancels the registration"]
pub struct CancelHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

struct Registry<F: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<F>)>,
}

pub struct Listeners<F: ?Sized> {
    inner: Arc<Mutex<Registry<F>>>,
}

impl<F: ?Sized> Clone for Listeners<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized + Send + Sync + 'static> Listeners<F> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn add(&self, listener: Arc<F>) -> CancelHandle {
        let id = {
            let mut registry = lock(&self.inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, listener));
            id
        };
        let weak: Weak<Mutex<Registry<F>>> = Arc::downgrade(&self.inner);
        CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    // call listeners outside the lock
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.inner).entries.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::{CancelHandle, Listeners};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Hook = dyn Fn(usize) + Send + Sync;

    #[test]
    fn dropping_handle_unregisters() {
        let listeners: Listeners<Hook> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let handle = listeners.add(Arc::new(move |n: usize| {
            counter.fetch_add(n, Ordering::SeqCst);
        }));
        for listener in listeners.snapshot() {
            listener(2);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        drop(handle);
        assert!(listeners.is_empty());
        for listener in listeners.snapshot() {
            listener(2);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_only_removes_its_own_entry() {
        let listeners: Listeners<Hook> = Listeners::new();
        let a = listeners.add(Arc::new(|_: usize| {}));
        let _b = listeners.add(Arc::new(|_: usize| {}));
        assert_eq!(listeners.len(), 2);
        a.cancel();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let listeners: Listeners<Hook> = Listeners::new();
        let handle = listeners.add(Arc::new(|_: usize| {}));
        drop(listeners);
        handle.cancel();
        CancelHandle::noop().cancel();
    }
}
