//! Event delivery: in-process callback plus a bounded polling queue.
//!
//! Both modes are always live. Every published event is handed to the
//! registered callback (if any) on the worker thread, then enqueued for
//! polling; a full queue drops its oldest entry and counts it. Callbacks
//! receive the event by reference and must copy anything they retain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use pagewatch_core::ChangeEvent;

pub type Callback = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

pub struct Subscribers {
    callback: Mutex<Option<Callback>>,
    queue: Mutex<VecDeque<ChangeEvent>>,
    capacity: usize,
    poll_drops: AtomicU64,
}

impl Subscribers {
    pub fn new(poll_queue_capacity: usize) -> Self {
        Self {
            callback: Mutex::new(None),
            queue: Mutex::new(VecDeque::with_capacity(poll_queue_capacity)),
            capacity: poll_queue_capacity,
            poll_drops: AtomicU64::new(0),
        }
    }

    pub fn set_callback(&self, cb: Option<Callback>) {
        *self.callback.lock().unwrap() = cb;
    }

    /// Delivers one event: callback first, then the polling queue.
    ///
    /// Called by the worker with no engine locks held, so a callback may
    /// re-enter the engine (`stats`, `unwatch`, even `watch`).
    pub fn deliver(&self, event: ChangeEvent) {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(&event);
        }

        let mut queue = self.queue.lock().unwrap();
        if queue.len() == self.capacity {
            // Oldest-out drop policy.
            queue.pop_front();
            self.poll_drops.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    /// Removes and returns up to `max` pending events, oldest first.
    pub fn drain(&self, max: usize) -> Vec<ChangeEvent> {
        let mut queue = self.queue.lock().unwrap();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn poll_drops(&self) -> u64 {
        self.poll_drops.load(Ordering::Relaxed)
    }
}
