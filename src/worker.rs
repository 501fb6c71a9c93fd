//! Background Worker Pool ("Backburner"): a fixed set of threads that
//! run queued callbacks and registered polling functions so LKV
//! dispatch and op triggers never run under a row mutex (spec §4.7).
//! Grounded in `original_source/src/whookie/Server.cpp`'s
//! worker-thread-with-swap-queue shape, generalized to this spec's
//! polling-function registry and configurable wakeup.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// An opaque unit of deferred work (spec §4.7: "opaque closures
/// returning int"). The return value currently has no consumer but is
/// kept so a future retry/backoff policy has something to inspect.
pub type WorkItem = Box<dyn FnOnce() -> i32 + Send>;

/// A function re-run once per swap cycle; returning 0 drops it,
/// nonzero keeps it registered for the next cycle.
pub type PollFn = Box<dyn FnMut() -> i32 + Send>;

#[derive(Debug, Clone, Copy)]
pub enum Wakeup {
    /// Busy-loop between cycles.
    Spin,
    /// Sleep a fixed number of milliseconds between cycles.
    SleepMs(u64),
    /// Block until a submission or poll-fn registration wakes the
    /// worker (stands in for a real pipe-wakeup fd).
    Blocking,
}

struct Signal {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new() -> Self {
        Signal { mutex: Mutex::new(false), condvar: Condvar::new() }
    }

    fn notify(&self) {
        let mut dirty = self.mutex.lock().unwrap();
        *dirty = true;
        self.condvar.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) {
        let mut dirty = self.mutex.lock().unwrap();
        if *dirty {
            *dirty = false;
            return;
        }
        match timeout {
            Some(t) => {
                let (guard, _) = self.condvar.wait_timeout(dirty, t).unwrap();
                dirty = guard;
            }
            None => {
                dirty = self.condvar.wait(dirty).unwrap();
            }
        }
        *dirty = false;
    }
}

/// Fixed thread-count background pool. Each worker owns a producer
/// queue (pushed by submitters) that is swapped out for an empty one
/// under a single lock once per cycle (spec §4.7), then drained
/// without holding the lock.
pub struct Backburner {
    queue: Arc<Mutex<Vec<WorkItem>>>,
    poll_fns: Arc<Mutex<Vec<PollFn>>>,
    signal: Arc<Signal>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Backburner {
    pub fn new(num_workers: usize, wakeup: Wakeup) -> Arc<Self> {
        let pool = Arc::new(Backburner {
            queue: Arc::new(Mutex::new(Vec::new())),
            poll_fns: Arc::new(Mutex::new(Vec::new())),
            signal: Arc::new(Signal::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(num_workers.max(1));
        for _ in 0..num_workers.max(1) {
            let queue = pool.queue.clone();
            let poll_fns = pool.poll_fns.clone();
            let signal = pool.signal.clone();
            let shutdown = pool.shutdown.clone();
            handles.push(thread::spawn(move || run_worker(queue, poll_fns, signal, shutdown, wakeup)));
        }
        *pool.threads.lock().unwrap() = handles;
        pool
    }

    pub fn submit(&self, item: WorkItem) {
        self.queue.lock().unwrap().push(item);
        self.signal.notify();
    }

    /// Submit a batch in one lock acquisition, used by LKV dispatch
    /// (spec §4.4: "handed to the background worker as a batch").
    pub fn submit_batch(&self, items: Vec<WorkItem>) {
        if items.is_empty() {
            return;
        }
        self.queue.lock().unwrap().extend(items);
        self.signal.notify();
    }

    pub fn register_poll_fn(&self, f: PollFn) {
        self.poll_fns.lock().unwrap().push(f);
        self.signal.notify();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.signal.notify();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Backburner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    queue: Arc<Mutex<Vec<WorkItem>>>,
    poll_fns: Arc<Mutex<Vec<PollFn>>>,
    signal: Arc<Signal>,
    shutdown: Arc<AtomicBool>,
    wakeup: Wakeup,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let batch = {
            let mut q = queue.lock().unwrap();
            std::mem::take(&mut *q)
        };
        for item in batch {
            item();
        }

        {
            let mut polls = poll_fns.lock().unwrap();
            polls.retain_mut(|f| f() != 0);
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match wakeup {
            Wakeup::Spin => thread::yield_now(),
            Wakeup::SleepMs(ms) => thread::sleep(Duration::from_millis(ms)),
            Wakeup::Blocking => signal.wait(Some(Duration::from_millis(500))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn submitted_work_runs_and_notifies() {
        let pool = Backburner::new(1, Wakeup::Blocking);
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || {
            tx.send(42).unwrap();
            0
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
        pool.shutdown();
    }

    #[test]
    fn poll_fn_is_dropped_once_it_returns_zero() {
        let pool = Backburner::new(1, Wakeup::SleepMs(5));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        pool.register_poll_fn(Box::new(move || {
            let prev = counter_clone.fetch_add(1, Ordering::SeqCst);
            if prev >= 2 {
                0
            } else {
                1
            }
        }));
        thread::sleep(Duration::from_millis(100));
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 3, "poll fn should have run at least 3 times, saw {seen}");
        pool.shutdown();
    }

    #[test]
    fn batch_submit_runs_every_item() {
        let pool = Backburner::new(2, Wakeup::Spin);
        let counter = Arc::new(AtomicUsize::new(0));
        let items: Vec<WorkItem> = (0..10)
            .map(|_| {
                let c = counter.clone();
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    0
                }) as WorkItem
            })
            .collect();
        pool.submit_batch(items);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.shutdown();
    }
}
