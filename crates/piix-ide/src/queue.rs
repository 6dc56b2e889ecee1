use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::request::Request;

/// Fixed-capacity FIFO with one slot kept unused, so `capacity - 1` requests fit.
#[derive(Debug)]
pub(crate) struct RequestRing {
    slots: Vec<Option<Request>>,
    head: usize,
    tail: usize,
}

impl RequestRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(2)],
            head: 0,
            tail: 0,
        }
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub(crate) fn is_full(&self) -> bool {
        self.next(self.tail) == self.head
    }

    pub(crate) fn len(&self) -> usize {
        (self.tail + self.slots.len() - self.head) % self.slots.len()
    }

    /// Appends a request, handing it back when the ring is full.
    pub(crate) fn push(&mut self, request: Request) -> Result<(), Request> {
        if self.is_full() {
            return Err(request);
        }
        self.slots[self.tail] = Some(request);
        self.tail = self.next(self.tail);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Request> {
        if self.is_empty() {
            return None;
        }
        let request = self.slots[self.head].take();
        self.head = self.next(self.head);
        request
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.tail = 0;
    }
}

#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) ring: RequestRing,
    /// Closed by a redo or by `suspend()`.
    pub(crate) paused: bool,
    pub(crate) worker_idle: bool,
    /// Request interrupted by a transient medium error, replayed first on resume.
    pub(crate) redo: Option<Request>,
    pub(crate) shutdown: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.ring.is_empty() && self.worker_idle && self.redo.is_none()
    }
}

/// Request ring plus the worker pause gate, guarded by the queue lock.
///
/// The queue lock is always the innermost lock: it may be taken while holding the controller
/// lock but never the other way round.
#[derive(Debug)]
pub(crate) struct RequestQueue {
    inner: Mutex<QueueState>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

impl RequestQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                ring: RequestRing::new(capacity),
                paused: false,
                worker_idle: true,
                redo: None,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues a request for the worker. Returns `false` if the ring is full.
    pub(crate) fn push(&self, request: Request) -> bool {
        let mut q = self.lock();
        if q.ring.push(request).is_err() {
            return false;
        }
        self.work_cv.notify_one();
        true
    }

    /// Drops every queued request and any pending redo.
    pub(crate) fn purge(&self) {
        let mut q = self.lock();
        q.ring.clear();
        q.redo = None;
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Whether requests are queued or a redo is waiting for replay.
    pub(crate) fn has_pending(&self) -> bool {
        let q = self.lock();
        !q.ring.is_empty() || q.redo.is_some()
    }

    /// Requests waiting in the ring, not counting a stashed redo.
    pub(crate) fn queued(&self) -> usize {
        self.lock().ring.len()
    }

    /// Blocks until a request is available and the gate is open. Returns `None` on shutdown.
    pub(crate) fn next_request(&self) -> Option<Request> {
        let mut q = self.lock();
        loop {
            if q.shutdown {
                return None;
            }
            if !q.paused {
                let request = match q.redo.take() {
                    Some(request) => Some(request),
                    None => q.ring.pop(),
                };
                if let Some(request) = request {
                    q.worker_idle = false;
                    return Some(request);
                }
            }
            if !q.worker_idle {
                q.worker_idle = true;
                self.idle_cv.notify_all();
            }
            q = self
                .work_cv
                .wait(q)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Keeps `request` for replay and closes the gate until [`RequestQueue::resume`].
    pub(crate) fn stash_redo(&self, request: Request) {
        let mut q = self.lock();
        q.redo = Some(request);
        q.paused = true;
    }

    pub(crate) fn suspend(&self) {
        let mut q = self.lock();
        q.paused = true;
        while !q.worker_idle && !q.shutdown {
            q = self
                .idle_cv
                .wait(q)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub(crate) fn resume(&self) {
        let mut q = self.lock();
        q.paused = false;
        self.work_cv.notify_all();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub(crate) fn wait_for_idle(&self, timeout: Duration) -> bool {
        let q = self.lock();
        let (q, _) = self
            .idle_cv
            .wait_timeout_while(q, timeout, |q| !q.is_idle())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        q.is_idle()
    }

    pub(crate) fn shutdown(&self) {
        let mut q = self.lock();
        q.shutdown = true;
        self.work_cv.notify_all();
        self.idle_cv.notify_all();
    }
}
