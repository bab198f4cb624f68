use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ferry_observe::FlowContext;

/// Live per-connection entries keyed by connection id, behind one lock.
/// Handlers mark their entry finished on exit; the periodic sweeper evicts
/// finished entries.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<u64, ConnectionEntry>>,
}

struct ConnectionEntry {
    context: FlowContext,
    started_at: Instant,
    finished: Arc<AtomicBool>,
}

/// Marks its registry entry finished when dropped, on every exit path.
pub struct ConnectionGuard {
    finished: Arc<AtomicBool>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, context: FlowContext) -> ConnectionGuard {
        let finished = Arc::new(AtomicBool::new(false));
        let entry = ConnectionEntry {
            started_at: Instant::now(),
            finished: Arc::clone(&finished),
            context,
        };
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .insert(entry.context.flow_id, entry);
        ConnectionGuard { finished }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|entry| !entry.finished.load(Ordering::Acquire))
            .count()
    }

    /// Evicts finished entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !entry.finished.load(Ordering::Acquire));
        before - entries.len()
    }

    /// Contexts of the connections still running, for host diagnostics.
    pub fn live_contexts(&self) -> Vec<FlowContext> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|entry| !entry.finished.load(Ordering::Acquire))
            .map(|entry| entry.context.clone())
            .collect()
    }

    /// Age of the oldest live entry, for host diagnostics.
    pub fn oldest_live_age(&self) -> Option<std::time::Duration> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|entry| !entry.finished.load(Ordering::Acquire))
            .map(|entry| entry.started_at.elapsed())
            .max()
    }
}
