//! Message-passing worker threads. A [`Worker`] owns one OS thread and one
//! mailbox; every posted job yields a [`JobHandle`] the poster can keep to
//! poll or wait on the latest operation. [`WorkerPool`] groups workers, and
//! [`shared_pool`] hands out refcounted class-shared pools (the cipher
//! engine is the in-tree user).

use crate::sync::Event;
use crossbeam_channel::{unbounded, Sender};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use slog::{o, Discard, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum Mail {
    Run(Box<dyn FnOnce() + Send>, Arc<JobState>),
    Shutdown,
}

struct JobState {
    done: AtomicBool,
    event: Event,
}

/// Completion handle for one posted job. The handle owns nothing but the
/// completion state, so the poster keeping the latest handle and the worker
/// freeing the job are never in conflict.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<JobState>,
}

impl JobHandle {
    /// A handle that is already complete. Useful as the initial value of a
    /// "latest operation" slot.
    pub fn finished() -> JobHandle {
        JobHandle {
            state: Arc::new(JobState {
                done: AtomicBool::new(true),
                event: Event::manual(true),
            }),
        }
    }

    fn pending() -> JobHandle {
        JobHandle {
            state: Arc::new(JobState {
                done: AtomicBool::new(false),
                event: Event::manual(false),
            }),
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// Waits for the job to finish. Returns false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.state.event.wait(timeout)
    }
}

/// One OS thread draining one mailbox in post order. Dropping the worker
/// posts a shutdown message and joins, so work posted before the drop always
/// runs to completion first.
pub struct Worker {
    mailbox: Sender<Mail>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<'a, L: Into<Option<&'a Logger>>>(name: &str, log: L) -> Worker {
        let log = match log.into() {
            Some(log) => log.new(o!("worker" => String::from(name))),
            None => Logger::root(Discard, o!()),
        };

        let (tx, rx) = unbounded::<Mail>();

        let thread = thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                slog::trace!(log, "worker thread started");

                for mail in rx.iter() {
                    match mail {
                        Mail::Run(job, state) => {
                            job();
                            state.done.store(true, Ordering::Release);
                            state.event.set();
                        }
                        Mail::Shutdown => break,
                    }
                }

                slog::trace!(log, "worker thread exiting");
            })
            .expect("worker thread spawn failed");

        Worker {
            mailbox: tx,
            thread: Some(thread),
        }
    }

    /// Posts a job to the mailbox and returns its completion handle.
    pub fn post<F: FnOnce() + Send + 'static>(&self, job: F) -> JobHandle {
        let handle = JobHandle::pending();
        self.mailbox
            .send(Mail::Run(Box::new(job), handle.state.clone()))
            .expect("worker mailbox closed before shutdown");
        handle
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Pending mail is always drained before the shutdown message is
        // reached, the mailbox is strictly FIFO.
        let _ = self.mailbox.send(Mail::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A fixed group of workers addressed by index.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        size: usize,
        name_prefix: &str,
        log: L,
    ) -> WorkerPool {
        assert!(size > 0, "worker pool must have at least one thread");

        let log = log.into();
        let workers = (0..size)
            .map(|n| Worker::spawn(&format!("{}-{}", name_prefix, n), log))
            .collect();

        WorkerPool { workers }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Posts a job to the worker at `index`.
    pub fn post_at<F: FnOnce() + Send + 'static>(&self, index: usize, job: F) -> JobHandle {
        self.workers[index].post(job)
    }
}

/// Identifies a class-shared worker pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PoolKind {
    /// Threads the packet cipher partitions work across.
    Cipher,
}

lazy_static! {
    static ref SHARED_POOLS: Mutex<HashMap<PoolKind, Weak<WorkerPool>>> =
        Mutex::new(HashMap::new());
}

/// Returns the shared pool for `kind`, creating it with one thread per
/// logical core on first use. The pool lives as long as any user holds the
/// returned `Arc` and is rebuilt on the next call after the last user is
/// gone.
pub fn shared_pool(kind: PoolKind) -> Arc<WorkerPool> {
    let mut registry = SHARED_POOLS.lock().unwrap();

    if let Some(pool) = registry.get(&kind).and_then(Weak::upgrade) {
        return pool;
    }

    let threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let pool = Arc::new(WorkerPool::new(threads, "cipher", None));
    registry.insert(kind, Arc::downgrade(&pool));
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_job_runs_and_handle_completes() {
        let worker = Worker::spawn("test", None);
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = {
            let counter = counter.clone();
            worker.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(handle.wait(Some(Duration::from_secs(5))));
        assert!(handle.is_finished());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jobs_run_in_post_order() {
        let worker = Worker::spawn("test", None);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut last = JobHandle::finished();
        for n in 0..16 {
            let order = order.clone();
            last = worker.post(move || order.lock().unwrap().push(n));
        }

        assert!(last.wait(Some(Duration::from_secs(5))));
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_pending_work() {
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let worker = Worker::spawn("test", None);
            for _ in 0..32 {
                let counter = counter.clone();
                worker.post(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }

        // Worker is joined; every posted job must have run.
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_finished_handle_is_immediately_done() {
        let handle = JobHandle::finished();
        assert!(handle.is_finished());
        assert!(handle.wait(Some(Duration::from_millis(0))));
    }

    #[test]
    fn test_pool_distributes_by_index() {
        let pool = WorkerPool::new(3, "test", None);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..pool.size())
            .map(|n| {
                let counter = counter.clone();
                pool.post_at(n, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.wait(Some(Duration::from_secs(5))));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_shared_pool_is_refcounted() {
        let first = shared_pool(PoolKind::Cipher);
        let second = shared_pool(PoolKind::Cipher);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
