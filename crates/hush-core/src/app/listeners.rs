//! Listener lists for hook-scoped events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{CompleteEvent, ErrorEvent, FallbackEvent, ScopedEvent, SuccessEvent, Verdict};

/// Handle returned by `add`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

fn next_id() -> ListenerId {
    ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
}

type Entries<F> = Mutex<Vec<(ListenerId, Arc<F>)>>;

fn lock<F: ?Sized>(entries: &Entries<F>) -> MutexGuard<'_, Vec<(ListenerId, Arc<F>)>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Listeners<E> {
    entries: Entries<dyn Fn(&E) + Send + Sync>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = next_id();
        lock(&self.entries).push((id, Arc::new(f)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(own, _)| *own != id);
        entries.len() != before
    }

    /// Call every listener in registration order. Listeners may add or
    /// remove listeners; the change applies from the next emit.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<_> = lock(&self.entries).iter().map(|(_, f)| Arc::clone(f)).collect();
        for f in snapshot {
            f(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Listeners that may veto. All of them run; any veto wins.
pub struct VetoListeners<E> {
    entries: Entries<dyn Fn(&E) -> Verdict + Send + Sync>,
}

impl<E> VetoListeners<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// `f` may return `Verdict`, `bool` (false vetoes) or `()`.
    pub fn add<F, V>(&self, f: F) -> ListenerId
    where
        F: Fn(&E) -> V + Send + Sync + 'static,
        V: Into<Verdict>,
    {
        let id = next_id();
        lock(&self.entries).push((id, Arc::new(move |e: &E| f(e).into())));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(own, _)| *own != id);
        entries.len() != before
    }

    pub fn check(&self, event: &E) -> Verdict {
        let snapshot: Vec<_> = lock(&self.entries).iter().map(|(_, f)| Arc::clone(f)).collect();
        let mut verdict = Verdict::Proceed;
        for f in snapshot {
            if f(event).is_veto() {
                verdict = Verdict::Veto;
            }
        }
        verdict
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for VetoListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The lifecycle subscriptions of one hook.
#[derive(Default)]
pub struct HookEvents {
    pub before_push_queue: VetoListeners<ScopedEvent>,
    pub pushed_queue: Listeners<ScopedEvent>,
    pub success: Listeners<SuccessEvent>,
    pub error: Listeners<ErrorEvent>,
    pub fallback: Listeners<FallbackEvent>,
    pub complete: Listeners<CompleteEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_calls_every_listener_until_removed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let listeners: Listeners<u32> = Listeners::new();

        let h = Arc::clone(&hits);
        let a = listeners.add(move |n| {
            h.fetch_add(*n as usize, Ordering::SeqCst);
        });
        let h = Arc::clone(&hits);
        listeners.add(move |_| {
            h.fetch_add(100, Ordering::SeqCst);
        });

        listeners.emit(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 101);

        assert!(listeners.remove(a));
        assert!(!listeners.remove(a));
        listeners.emit(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 201);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn any_veto_wins_and_all_run() {
        let ran = Arc::new(AtomicUsize::new(0));
        let listeners: VetoListeners<()> = VetoListeners::new();

        let r = Arc::clone(&ran);
        listeners.add(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            false
        });
        let r = Arc::clone(&ran);
        listeners.add(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(listeners.check(&()), Verdict::Veto);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_listeners_proceed() {
        let listeners: VetoListeners<()> = VetoListeners::new();
        assert_eq!(listeners.check(&()), Verdict::Proceed);
        assert!(listeners.is_empty());
    }
}
