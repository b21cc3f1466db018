//! Worker pool for blocking work, with results returned through a mailbox.
//!
//! The interactive thread submits jobs to a [`Dispatcher`] and later drains a
//! [`Mailbox`]; nothing is ever delivered to it asynchronously.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Dispatcher {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(anyhow!("dispatcher needs at least one worker"));
        }
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("camguard-worker-{}", index))
                .spawn(move || worker_loop(index, receiver))?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("dispatcher is shut down"))?;
        sender
            .send(Box::new(job))
            .map_err(|_| anyhow!("dispatcher workers have exited"))
    }

    /// Runs `job` on a worker and posts its result to `mailbox`.
    pub fn run<T, F>(&self, mailbox: &Mailbox<T>, job: F) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let reply = mailbox.sender();
        self.submit(move || {
            let _ = reply.send(job());
        })
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.sender.take();
        let mut panicked = 0usize;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow!("{} dispatcher worker(s) panicked", panicked));
        }
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("{}", e);
        }
    }
}

fn worker_loop(index: usize, receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let Ok(receiver) = receiver.lock() else {
                log::error!("worker {} lost the job queue", index);
                return;
            };
            receiver.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => {
                log::debug!("worker {} exiting", index);
                return;
            }
        }
    }
}

/// Results posted by workers, drained explicitly by the owning thread.
pub struct Mailbox<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> Sender<T> {
        self.sender.clone()
    }

    /// Everything posted so far, without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn results_arrive_in_mailbox() -> Result<()> {
        let dispatcher = Dispatcher::new(3)?;
        let mailbox = Mailbox::new();
        for i in 0..10u32 {
            dispatcher.run(&mailbox, move || i * 2)?;
        }
        let mut results = Vec::new();
        while results.len() < 10 {
            let item = mailbox
                .recv_timeout(Duration::from_secs(5))
                .expect("result in time");
            results.push(item);
        }
        results.sort_unstable();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert!(mailbox.drain().is_empty());
        Ok(())
    }

    #[test]
    fn shutdown_finishes_queued_jobs() -> Result<()> {
        let dispatcher = Dispatcher::new(1)?;
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = done.clone();
            dispatcher.submit(move || {
                std::thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            })?;
        }
        dispatcher.shutdown()?;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        Ok(())
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(Dispatcher::new(0).is_err());
    }

    #[test]
    fn worker_panic_is_reported() -> Result<()> {
        let dispatcher = Dispatcher::new(1)?;
        dispatcher.submit(|| panic!("boom"))?;
        assert!(dispatcher.shutdown().is_err());
        Ok(())
    }
}
