use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, info};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Worker-local async pool: one MPMC queue, T consumers. The reactor thread
/// only enqueues; with T == 0 jobs run inline on the caller (the
/// single-worker single-thread fast path).
pub(crate) struct AsyncPool {
    tx: Option<Sender<Job>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl AsyncPool {
    pub(crate) fn new(threads: usize) -> Self {
        if threads == 0 {
            return Self { tx: None, threads: Vec::new() };
        }
        let (tx, rx): (Sender<Job>, Receiver<Job>) = unbounded();
        let threads = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("ember-async-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        debug!("async worker exiting");
                    })
                    .expect("spawning an async worker thread")
            })
            .collect();
        Self { tx: Some(tx), threads }
    }

    /// Handle used by connections to enqueue; cheap to clone.
    pub(crate) fn handle(&self) -> PoolHandle {
        PoolHandle { tx: self.tx.clone() }
    }

    /// Closes the queue and joins the consumers.
    pub(crate) fn shutdown(mut self) {
        drop(self.tx.take());
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("async pool drained");
    }
}

#[derive(Clone)]
pub(crate) struct PoolHandle {
    tx: Option<Sender<Job>>,
}

impl PoolHandle {
    #[inline]
    pub(crate) fn spawn(&self, job: Job) {
        match &self.tx {
            Some(tx) => {
                if tx.send(job).is_err() {
                    debug!("async pool closed, job dropped");
                }
            }
            // Fast path: no async threads, run inline.
            None => job(),
        }
    }
}

/// Per-connection serial executor on top of the pool.
///
/// Jobs for one connection run in submission order, never concurrently;
/// jobs for different connections interleave freely across the pool.
#[derive(Clone)]
pub(crate) struct Serializer {
    inner: Arc<SerializerInner>,
}

struct SerializerInner {
    pool: PoolHandle,
    queue: Mutex<VecDeque<Job>>,
    running: AtomicBool,
}

impl Serializer {
    pub(crate) fn new(pool: PoolHandle) -> Self {
        Self {
            inner: Arc::new(SerializerInner {
                pool,
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn submit(&self, job: Job) {
        self.inner.queue.lock().push_back(job);
        if !self.inner.running.swap(true, Ordering::AcqRel) {
            let inner = self.inner.clone();
            self.inner.pool.spawn(Box::new(move || drive(&inner)));
        }
    }
}

fn drive(inner: &Arc<SerializerInner>) {
    loop {
        let Some(job) = inner.queue.lock().pop_front() else {
            inner.running.store(false, Ordering::Release);
            // A submit may have raced the store; reclaim the run if so.
            if inner.queue.lock().is_empty()
                || inner.running.swap(true, Ordering::AcqRel)
            {
                return;
            }
            continue;
        };
        job();
    }
}
