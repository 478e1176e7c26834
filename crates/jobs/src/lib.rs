//! Bounded work queue drained by one dedicated worker thread.
//!
//! Jobs are stored in a fixed ring of slots. Each enqueued job gets the next
//! value of a monotonically increasing generation counter; slot `id % capacity`
//! holds it. A [`JobHandle`] only refers to its job while the slot still
//! stores the same generation, so handles go stale once the slot is reused.
//!
//! Enqueueing blocks while the ring is full, so it must only be called from
//! non-real-time threads, and never from inside a job.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

pub const DEFAULT_CAPACITY: usize = 256;

const EMPTY_SLOT: u64 = u64::MAX;

type Job = Box<dyn for<'a> FnOnce(&JobContext<'a>) + Send>;

/// Passed to a running job.
pub struct JobContext<'a> {
    id: u64,
    cancel: &'a AtomicBool,
}

impl JobContext<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Set by [`DeferredJobQueue::stop`]. Long jobs should poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    id: u64,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Slot {
    id: AtomicU64,
    cancel: AtomicBool,
    job: Mutex<Option<Job>>,
}

struct Shared {
    slots: Box<[Slot]>,
    /// Generation of the next job to enqueue.
    write_pos: AtomicU64,
    /// Generation of the next job the worker will take.
    read_pos: AtomicU64,
    /// Every job with a generation below this has finished.
    completed: AtomicU64,
    shutdown: AtomicBool,
    writer: Mutex<()>,
    signal: Mutex<()>,
    work_ready: Condvar,
    job_done: Condvar,
}

impl Shared {
    #[inline]
    fn slot(&self, id: u64) -> &Slot {
        &self.slots[(id % self.slots.len() as u64) as usize]
    }

    #[inline]
    fn is_done(&self, id: u64) -> bool {
        id < self.completed.load(Ordering::Acquire)
    }

    fn run(&self, name: &str) {
        loop {
            let id = self.read_pos.load(Ordering::Relaxed);
            if !self.wait_for_work(id) {
                debug!(queue = name, "worker exiting");
                return;
            }

            let slot = self.slot(id);
            let job = slot.job.lock().take();
            self.read_pos.store(id + 1, Ordering::Release);

            if let Some(job) = job {
                let ctx = JobContext {
                    id,
                    cancel: &slot.cancel,
                };
                if catch_unwind(AssertUnwindSafe(|| job(&ctx))).is_err() {
                    error!(queue = name, job = id, "deferred job panicked");
                }
            }

            self.completed.store(id + 1, Ordering::Release);
            let _guard = self.signal.lock();
            self.job_done.notify_all();
        }
    }

    /// Spin briefly, then block, until job `id` has been published. Returns
    /// `false` once the queue is shut down and drained.
    fn wait_for_work(&self, id: u64) -> bool {
        let backoff = Backoff::new();
        while self.write_pos.load(Ordering::Acquire) <= id {
            if self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            if backoff.is_completed() {
                let mut guard = self.signal.lock();
                while self.write_pos.load(Ordering::Acquire) <= id
                    && !self.shutdown.load(Ordering::Acquire)
                {
                    self.work_ready.wait(&mut guard);
                }
            } else {
                backoff.snooze();
            }
        }
        true
    }
}

pub struct DeferredJobQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DeferredJobQueue {
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        Self::with_name("daw-jobs", capacity)
    }

    /// Create the queue and spawn its worker thread named `name`.
    pub fn with_name(name: &str, capacity: usize) -> std::io::Result<Self> {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Slot {
                id: AtomicU64::new(EMPTY_SLOT),
                cancel: AtomicBool::new(false),
                job: Mutex::new(None),
            })
            .collect();

        let shared = Arc::new(Shared {
            slots,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            writer: Mutex::new(()),
            signal: Mutex::new(()),
            work_ready: Condvar::new(),
            job_done: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let thread_name = name.to_string();
        let worker = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker_shared.run(&thread_name))?;

        debug!(queue = name, capacity, "job queue started");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Jobs enqueued but not yet finished, including a running one.
    pub fn pending(&self) -> usize {
        let written = self.shared.write_pos.load(Ordering::Acquire);
        let completed = self.shared.completed.load(Ordering::Acquire);
        written.saturating_sub(completed) as usize
    }

    /// Queue `job`, blocking while every slot is occupied.
    pub fn enqueue<F>(&self, job: F) -> JobHandle
    where
        F: for<'a> FnOnce(&JobContext<'a>) + Send + 'static,
    {
        let shared = &*self.shared;
        let _writer = shared.writer.lock();
        let id = shared.write_pos.load(Ordering::Relaxed);
        let capacity = shared.slots.len() as u64;

        // The slot is free once its previous occupant (id - capacity) has finished.
        if id >= capacity && !shared.is_done(id - capacity) {
            let mut guard = shared.signal.lock();
            while !shared.is_done(id - capacity) {
                shared.job_done.wait(&mut guard);
            }
        }

        let slot = shared.slot(id);
        *slot.job.lock() = Some(Box::new(job));
        slot.cancel.store(false, Ordering::Relaxed);
        slot.id.store(id, Ordering::Release);
        shared.write_pos.store(id + 1, Ordering::Release);

        let _guard = shared.signal.lock();
        shared.work_ready.notify_one();
        JobHandle { id }
    }

    /// Ask a job to stop. Advisory only: the job must check
    /// [`JobContext::is_cancelled`]. Returns `false` for a stale handle.
    pub fn stop(&self, handle: JobHandle) -> bool {
        let slot = self.shared.slot(handle.id);
        if slot.id.load(Ordering::Acquire) != handle.id {
            return false;
        }
        slot.cancel.store(true, Ordering::Relaxed);
        true
    }

    /// Whether the handle's slot still holds its job (queued, running or
    /// finished but not yet overwritten).
    pub fn is_valid(&self, handle: JobHandle) -> bool {
        self.shared.slot(handle.id).id.load(Ordering::Acquire) == handle.id
    }

    pub fn is_complete(&self, handle: JobHandle) -> bool {
        self.shared.is_done(handle.id)
    }

    /// Block until the job has finished or `timeout` elapses. Returns whether
    /// it finished.
    pub fn wait(&self, handle: JobHandle, timeout: Duration) -> bool {
        let shared = &*self.shared;
        if shared.is_done(handle.id) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = shared.signal.lock();
        while !shared.is_done(handle.id) {
            if shared.job_done.wait_until(&mut guard, deadline).timed_out() {
                return shared.is_done(handle.id);
            }
        }
        true
    }

    /// Block until every job enqueued so far has finished.
    pub fn wait_all(&self) {
        let shared = &*self.shared;
        let target = shared.write_pos.load(Ordering::Acquire);
        let mut guard = shared.signal.lock();
        while shared.completed.load(Ordering::Acquire) < target {
            shared.job_done.wait(&mut guard);
        }
    }

    /// Cancel outstanding jobs, let the worker drain the ring and join it.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let shared = &*self.shared;
        let written = shared.write_pos.load(Ordering::Acquire);
        let completed = shared.completed.load(Ordering::Acquire);
        for id in completed..written {
            shared.slot(id).cancel.store(true, Ordering::Relaxed);
        }

        shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = shared.signal.lock();
            shared.work_ready.notify_all();
        }
        if worker.join().is_err() {
            error!("job worker panicked during shutdown");
        }
    }
}

impl Drop for DeferredJobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
