use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Job(Job),
    Terminate,
}

/// Background workers for blocking or CPU-heavy work the loop thread
/// must not absorb. Jobs hand their results back to the loop through a
/// cloned [`Wakeup`](crate::Wakeup) handle and a connection id; they
/// must never touch a `Manager` or `Connection` directly.
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: mpsc::Sender<WorkerMessage>,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<WorkerMessage>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..capacity.max(1))
            .map(|id| Worker::new(id, Arc::clone(&receiver)))
            .collect();

        Self { workers, sender }
    }

    pub fn exec<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(WorkerMessage::Job(Box::new(job)))
            .map_err(|_| Error::Usage("thread pool is shut down"))
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(WorkerMessage::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<WorkerMessage>>>) -> Self {
        let thread = Builder::new()
            .name(format!("millrace-worker-{id}"))
            .spawn(move || loop {
                let message = {
                    let receiver = match receiver.lock() {
                        Ok(guard) => guard,
                        Err(_) => break,
                    };
                    match receiver.recv() {
                        Ok(message) => message,
                        Err(_) => break,
                    }
                };
                match message {
                    WorkerMessage::Job(job) => job(),
                    WorkerMessage::Terminate => break,
                }
            })
            .ok();

        if thread.is_none() {
            log::error!("failed to spawn worker thread {}", id);
        }
        Self { thread }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_workers() {
        let pool = ThreadPool::new(2);
        assert_eq!(pool.workers_len(), 2);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.exec(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_drop_waits_for_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2);
            let counter = counter.clone();
            pool.exec(move || {
                std::thread::sleep(Duration::from_millis(50));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
