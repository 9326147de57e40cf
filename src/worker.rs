//! Bounded worker pool for backend request execution.
//!
//! Threads are spawned lazily as work arrives and retired after sitting
//! idle, so a mostly-quiet proxy carries almost no threads while a burst can
//! fan out to the full cap. Admission is counted with an atomic so the
//! number of accepted-but-unfinished items never exceeds `max_workers`;
//! rejected items are handed back to the caller, which owns deciding what
//! an overload reply looks like.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

/// How long an idle worker thread waits for work before exiting.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WorkerPool<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        WorkerPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    handler: Box<dyn Fn(T) + Send + Sync>,
    max_workers: usize,
    spawned: AtomicUsize,
    idle: AtomicUsize,
    in_flight: AtomicUsize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(max_workers: usize, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (tx, rx) = bounded(max_workers);
        WorkerPool {
            inner: Arc::new(Inner {
                tx,
                rx,
                handler: Box::new(handler),
                max_workers,
                spawned: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Hand an item to the pool. Returns the item back when the pool already
    /// holds `max_workers` accepted-but-unfinished items.
    pub fn submit(&self, item: T) -> Result<(), T> {
        let prev = self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        if prev >= self.inner.max_workers {
            self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(item);
        }

        // Queue capacity equals the admission cap, so this send cannot block.
        match self.inner.tx.try_send(item) {
            Ok(()) => {
                self.maybe_spawn();
                Ok(())
            }
            Err(e) => {
                self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                Err(e.into_inner())
            }
        }
    }

    /// Accepted items not yet finished by a handler.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Spawn a worker if none is idle and the thread cap allows it.
    fn maybe_spawn(&self) {
        if self.inner.idle.load(Ordering::Acquire) > 0 {
            return;
        }
        loop {
            let current = self.inner.spawned.load(Ordering::Acquire);
            if current >= self.inner.max_workers {
                return;
            }
            if self
                .inner
                .spawned
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let inner = Arc::clone(&self.inner);
            let spawn = thread::Builder::new()
                .name(format!("worker-{}", current))
                .spawn(move || worker_loop(&inner));
            if spawn.is_err() {
                self.inner.spawned.fetch_sub(1, Ordering::AcqRel);
            }
            return;
        }
    }
}

fn worker_loop<T: Send + 'static>(inner: &Inner<T>) {
    loop {
        inner.idle.fetch_add(1, Ordering::AcqRel);
        let received = inner.rx.recv_timeout(IDLE_TIMEOUT);
        inner.idle.fetch_sub(1, Ordering::AcqRel);

        match received {
            Ok(item) => {
                (inner.handler)(item);
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Err(RecvTimeoutError::Timeout) => {
                if inner.rx.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    inner.spawned.fetch_sub(1, Ordering::AcqRel);
    debug!("worker thread retired");
}

// ============================================================================
// Tests
// ============================================================================
