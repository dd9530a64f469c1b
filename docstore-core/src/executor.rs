//! Worker pool for chunk compression

use crate::{Result, StoreError};
use crossbeam_channel::{Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Unit of work submitted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks, possibly concurrently and in any order
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Fixed-size pool of named worker threads fed by an unbounded channel
pub struct ThreadPoolExecutor {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    /// Spawn `threads` workers named `<name>-<n>`
    pub fn new(threads: usize, name: &str) -> Result<Self> {
        if threads == 0 {
            return Err(StoreError::Config(
                "executor needs at least one thread".into(),
            ));
        }

        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || Self::worker_loop(receiver))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    fn worker_loop(receiver: Receiver<Task>) {
        for task in receiver.iter() {
            task();
        }
        debug!("executor.worker_exit");
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        if let Some(sender) = &self.sender {
            // Receivers outlive the sender, so send only fails during drop
            let _ = sender.send(task);
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        // Closing the channel lets workers drain queued tasks and exit
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Executor that queues tasks until a test runs them explicitly
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ManualExecutor {
    tasks: parking_lot::Mutex<Vec<Option<Task>>>,
}

#[cfg(test)]
impl ManualExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of tasks submitted so far, run or not
    pub(crate) fn submitted(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run the task with submission index `index`
    pub(crate) fn run(&self, index: usize) {
        let task = self.tasks.lock()[index].take();
        if let Some(task) = task {
            task();
        }
    }

    /// Run every pending task in submission order, including ones they submit
    pub(crate) fn run_all(&self) {
        let mut index = 0;
        while index < self.submitted() {
            self.run(index);
            index += 1;
        }
    }
}

#[cfg(test)]
impl Executor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push(Some(task));
    }
}
