use can_transport::CanFrame;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Frame handler invoked on the dispatch thread.
pub type Callback = Arc<dyn Fn(&CanFrame) + Send + Sync>;

/// Opaque handle for a registered listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

#[derive(Clone)]
pub struct Listener {
    pub id: ListenerId,
    pub callback: Callback,
}

#[derive(Default)]
struct Slots {
    closed: bool,
    listeners: Vec<Listener>,
}

/// Registered listeners in registration order. Once closed it stays empty.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    slots: RwLock<Slots>,
}

impl ListenerRegistry {
    /// `None` once the registry has been closed.
    pub fn register(&self, callback: Callback) -> Option<ListenerId> {
        let mut slots = self.slots.write();
        if slots.closed {
            return None;
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        slots.listeners.push(Listener { id, callback });
        Some(id)
    }

    /// Copy of the current listeners; the lock is not held while they run,
    /// so a callback may register further listeners.
    pub fn snapshot(&self) -> Vec<Listener> {
        self.slots.read().listeners.clone()
    }

    /// Drop every listener and refuse new ones.
    pub fn close(&self) {
        let mut slots = self.slots.write();
        slots.closed = true;
        slots.listeners.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.read().closed
    }

    pub fn len(&self) -> usize {
        self.slots.read().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let reg = ListenerRegistry::default();
        let a = reg.register(Arc::new(|_| {})).unwrap();
        let b = reg.register(Arc::new(|_| {})).unwrap();
        assert_ne!(a, b);
        let ids: Vec<ListenerId> = reg.snapshot().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_closed_registry_refuses_listeners() {
        let reg = ListenerRegistry::default();
        reg.register(Arc::new(|_| {})).unwrap();
        reg.close();
        assert!(reg.is_closed());
        assert!(reg.is_empty());
        assert!(reg.register(Arc::new(|_| {})).is_none());
        assert!(reg.is_empty());
    }
}
