use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, warn};
use thiserror::Error;

use crate::lock;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("thread pool is shut down")]
pub struct PoolClosed;

/// Fixed set of worker threads pulling jobs off one queue.
///
/// Jobs run in submission order per worker but complete in any order. Dropping
/// the pool (or calling [`shutdown`](Self::shutdown)) closes the queue, lets
/// queued jobs finish and joins the workers.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver)));
        }

        Self {
            workers,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn execute<F>(&self, f: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        match lock(&self.sender).as_ref() {
            Some(sender) => sender.send(job).map_err(|_| PoolClosed),
            None => Err(PoolClosed),
        }
    }

    /// Stops accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        drop(lock(&self.sender).take());
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last handle may be dropped by one of our own jobs.
            if worker.thread.thread().id() == current {
                continue;
            }
            debug!("shutting down worker {}", worker.id);
            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(name: &str, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Self {
        let thread = thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(move || {
                loop {
                    let msg = lock(&receiver).recv();
                    match msg {
                        Ok(job) => {
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"));

        Self { id, thread }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[test]
    fn runs_every_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new("test", 3);

        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        drop(pool);

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn rejects_after_shutdown() {
        let pool = ThreadPool::new("test", 1);
        pool.shutdown();
        assert_eq!(pool.execute(|| {}), Err(PoolClosed));
    }

    #[test]
    fn jobs_can_resubmit() {
        let pool = Arc::new(ThreadPool::new("test", 2));
        let (tx, rx) = mpsc::channel();

        let inner = Arc::clone(&pool);
        pool.execute(move || {
            inner.execute(move || tx.send(42).unwrap()).unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    }
}
