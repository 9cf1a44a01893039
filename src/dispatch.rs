//! Bounded worker pool for user callbacks.
//!
//! Callbacks run off the session reader threads so user code can never
//! block frame processing, and a panicking callback is confined to its
//! worker. The queue is bounded: a callback storm backpressures the
//! enqueueing thread instead of growing without limit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use log::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_QUEUE_LEN: usize = 1024;

pub(crate) struct CallbackPool {
    sender: SyncSender<Job>,
}

impl CallbackPool {
    /// Start a pool with the given number of workers and queue capacity.
    pub(crate) fn new(workers: usize, queue_len: usize) -> Arc<CallbackPool> {
        let (sender, receiver) = sync_channel::<Job>(queue_len.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        for index in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let spawned = thread::Builder::new()
                .name(format!("ws-callback-{}", index))
                .spawn(move || worker_loop(&receiver));
            if let Err(err) = spawned {
                warn!("failed to spawn callback worker: {}", err);
            }
        }
        Arc::new(CallbackPool { sender })
    }

    /// The process-wide pool shared by all sessions.
    pub(crate) fn global() -> Arc<CallbackPool> {
        static POOL: OnceLock<Arc<CallbackPool>> = OnceLock::new();
        Arc::clone(POOL.get_or_init(|| CallbackPool::new(DEFAULT_WORKERS, DEFAULT_QUEUE_LEN)))
    }

    /// Enqueue a callback. Blocks while the queue is full.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("callback pool has shut down, dropping callback");
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = match receiver.lock().unwrap().recv() {
            Ok(job) => job,
            Err(_) => return,
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("user callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn executes_jobs() {
        let pool = CallbackPool::new(2, 16);
        let (done, results) = channel();
        for i in 0..10 {
            let done = done.clone();
            pool.execute(move || done.send(i).unwrap());
        }
        let mut received: Vec<i32> = (0..10)
            .map(|_| results.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        received.sort_unstable();
        assert_eq!(received, (0..10).collect::<Vec<i32>>());
    }

    #[test]
    fn panicking_job_does_not_kill_the_pool() {
        let pool = CallbackPool::new(1, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(|| panic!("callback blew up"));

        let (done, observed) = channel();
        let counter_in_job = Arc::clone(&counter);
        pool.execute(move || {
            counter_in_job.fetch_add(1, Ordering::SeqCst);
            done.send(()).unwrap();
        });

        observed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
