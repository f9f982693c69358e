use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::warn;

use super::types::{QueueEvent, UploadProgress};

pub type Listener = Arc<dyn Fn(&QueueEvent, &UploadProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Plain observer list. Delivery is best-effort and a panicking listener is
/// contained so the scheduling loop keeps running.
#[derive(Default)]
pub struct ListenerSet {
    inner: Mutex<ListenerTable>,
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

impl ListenerSet {
    pub fn add(&self, listener: Listener) -> ListenerId {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = ListenerId(table.next_id);
        table.next_id += 1;
        table.listeners.push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = table.listeners.len();
        table.listeners.retain(|(lid, _)| *lid != id);
        table.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every listener registered at the time of the call. The table
    /// lock is not held while listeners run, so they may add or remove
    /// listeners themselves.
    pub fn emit(&self, event: &QueueEvent, progress: &UploadProgress) {
        let snapshot: Vec<Listener> = {
            let table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            table.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener(event, progress)));
            if result.is_err() {
                warn!("Upload queue listener panicked on {:?}; ignoring", event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload_queue::types::{JobId, JobRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn event() -> QueueEvent {
        QueueEvent::Queued(JobRef {
            job_id: JobId(0),
            session_id: Uuid::nil(),
            chunk_index: 0,
        })
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let set = ListenerSet::default();
        let calls = Arc::new(AtomicUsize::new(0));
        set.add(Arc::new(|_, _| panic!("listener bug")));
        let c = Arc::clone(&calls);
        set.add(Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        set.emit(&event(), &UploadProgress::default());
        set.emit(&event(), &UploadProgress::default());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let set = ListenerSet::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let id = set.add(Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());

        set.emit(&event(), &UploadProgress::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
