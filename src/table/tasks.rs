//! Tracking of detached background work.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread;

/// Counts running background tasks so shutdown can wait for them.
#[derive(Debug, Default)]
pub(crate) struct TaskGroup {
    running: Mutex<usize>,
    cond: Condvar,
}

/// Marks a task as running until dropped.
pub(crate) struct TaskGuard<'a>(&'a TaskGroup);

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.0.running.lock();
        *running -= 1;
        if *running == 0 {
            self.0.cond.notify_all();
        }
    }
}

impl TaskGroup {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a task running on the current thread.
    pub(crate) fn enter(&self) -> TaskGuard<'_> {
        *self.running.lock() += 1;
        TaskGuard(self)
    }

    /// Runs `f` on a new named thread tracked by this group.
    pub(crate) fn spawn<F>(self: &Arc<Self>, name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        *self.running.lock() += 1;
        let group = Arc::clone(self);
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _guard = TaskGuard(&group);
            f();
        });
        if let Err(e) = spawned {
            drop(TaskGuard(self));
            return Err(e);
        }
        Ok(())
    }

    /// Number of running tasks.
    #[cfg(test)]
    pub(crate) fn running(&self) -> usize {
        *self.running.lock()
    }

    /// Blocks until no task is running.
    pub(crate) fn wait(&self) {
        let mut running = self.running.lock();
        while *running > 0 {
            self.cond.wait(&mut running);
        }
    }
}
