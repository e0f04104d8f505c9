//! Cooperative task orchestration
//!
//! A [`TaskGroup`] runs a fixed set of [`Task`]s, each on its own tokio task.
//! As soon as one of them finishes, successfully or not, every task still
//! running is asked to stop. The group then waits for all of them and
//! aggregates the failures. Dropping the [`TaskGroup::run`] future stops and
//! aborts every task that has not finished yet.

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinError};

/// Cancellable unit of work
#[async_trait::async_trait]
pub trait Task<E>: Send + Sync + 'static {
    /// Run until finished or stopped
    async fn run(&self) -> Result<(), E>;

    /// Ask a running task to finish early
    ///
    /// Must be idempotent and safe to call after the task finished.
    fn stop(&self);
}

/// Shared task type
pub type BoxedTask<E> = Arc<dyn Task<E>>;

/// Group of tasks that stop together
pub struct TaskGroup<E> {
    tasks: Vec<BoxedTask<E>>,
}

impl<E> fmt::Debug for TaskGroup<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl<E> Default for TaskGroup<E> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<E> TaskGroup<E>
where
    E: From<JoinError> + Send + 'static,
{
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, returning its index in the group
    pub fn push(&mut self, task: BoxedTask<E>) -> usize {
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    /// Number of tasks in the group
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check whether the group has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task and wait for all of them
    ///
    /// A task that panics is recorded as a failure converted from its
    /// [`JoinError`].
    pub async fn run(self) -> Result<(), TaskGroupError<E>> {
        let mut running = FuturesUnordered::new();
        let mut spawned = Spawned {
            tasks: &self.tasks,
            aborts: Vec::with_capacity(self.tasks.len()),
            finished: vec![false; self.tasks.len()],
        };
        for (index, task) in self.tasks.iter().enumerate() {
            let task = task.clone();
            let handle = tokio::spawn(async move { task.run().await });
            spawned.aborts.push(handle.abort_handle());
            running.push(async move { (index, handle.await) });
        }

        let mut stopping = false;
        let mut failures = Vec::new();

        while let Some((index, joined)) = running.next().await {
            spawned.finished[index] = true;

            let outcome = joined.unwrap_or_else(|e| Err(E::from(e)));
            match outcome {
                Ok(()) => tracing::trace!(task = index, "task finished"),
                Err(e) => {
                    tracing::trace!(task = index, "task failed");
                    failures.push((index, e));
                }
            }

            if !stopping {
                stopping = true;
                tracing::debug!(task = index, "first task finished, stopping the group");
                spawned.stop_unfinished();
            }
        }

        match failures.first().map(|(index, _)| *index) {
            None => Ok(()),
            Some(first) => {
                failures.sort_by_key(|(index, _)| *index);
                Err(TaskGroupError { failures, first })
            }
        }
    }
}

/// Tasks spawned by one [`TaskGroup::run`] call
struct Spawned<'a, E: 'static> {
    tasks: &'a [BoxedTask<E>],
    aborts: Vec<AbortHandle>,
    finished: Vec<bool>,
}

impl<E: 'static> Spawned<'_, E> {
    fn stop_unfinished(&self) {
        for (task, _) in self.unfinished() {
            task.stop();
        }
    }

    fn unfinished(&self) -> impl Iterator<Item = (&BoxedTask<E>, &AbortHandle)> {
        self.tasks
            .iter()
            .zip(&self.aborts)
            .zip(&self.finished)
            .filter(|(_, finished)| !**finished)
            .map(|(pair, _)| pair)
    }
}

// Runs only when `run` is cancelled; a completed run has no unfinished tasks.
impl<E: 'static> Drop for Spawned<'_, E> {
    fn drop(&mut self) {
        let mut aborted = 0;
        for (task, abort) in self.unfinished() {
            task.stop();
            abort.abort();
            aborted += 1;
        }
        if aborted > 0 {
            tracing::debug!(aborted, "task group dropped, aborting unfinished tasks");
        }
    }
}

/// Failures of a [`TaskGroup`] run, ordered by task index
pub struct TaskGroupError<E> {
    failures: Vec<(usize, E)>,
    first: usize,
}

impl<E> TaskGroupError<E> {
    /// Index and error of the first task that failed
    pub fn first(&self) -> (usize, &E) {
        let (index, err) = self
            .failures
            .iter()
            .find(|(index, _)| *index == self.first)
            .unwrap_or(&self.failures[0]);
        (*index, err)
    }

    /// Take the first recorded failure
    pub fn into_first(self) -> (usize, E) {
        let first = self.first;
        let mut failures = self.failures;
        let position = failures
            .iter()
            .position(|(index, _)| *index == first)
            .unwrap_or(0);
        failures.swap_remove(position)
    }

    /// Error of the task at `index`, if it failed
    pub fn get(&self, index: usize) -> Option<&E> {
        self.failures
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, err)| err)
    }

    /// Iterate over failures in task index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &E)> {
        self.failures.iter().map(|(index, err)| (*index, err))
    }

    /// Number of failed tasks
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Always false, a group error holds at least one failure
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<E: fmt::Debug> fmt::Debug for TaskGroupError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroupError")
            .field("failures", &self.failures)
            .field("first", &self.first)
            .finish()
    }
}

impl<E: fmt::Display> fmt::Display for TaskGroupError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (index, err) = self.first();
        write!(f, "task {} failed: {}", index, err)?;
        if self.failures.len() > 1 {
            write!(f, " (and {} more)", self.failures.len() - 1)?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for TaskGroupError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.first().1)
    }
}
