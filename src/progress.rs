//! Shared progress counter and background batch handles.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

/// Settle time between tearing down a batch's pool and running its cleanup.
pub const CLEANUP_DELAY: Duration = Duration::from_millis(500);

/// Completed-item counter shared between a batch and whoever watches it.
#[derive(Debug, Clone, Default)]
pub struct SharedProgress {
    done: Arc<Mutex<usize>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one completed item and return the new count.
    pub fn increment(&self) -> usize {
        let mut done = self.lock();
        *done += 1;
        *done
    }

    pub fn get(&self) -> usize {
        *self.lock()
    }

    pub fn reset(&self) {
        *self.lock() = 0;
    }

    // A poisoned counter still holds a usable count.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Running,
    /// Every item has been submitted and results are still being collected.
    /// Lasts through pool teardown and cleanup.
    Draining,
    Completed,
}

pub type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// The part of a [`BatchHandle`] its job can reach.
#[derive(Debug, Clone)]
pub struct BatchContext {
    progress: SharedProgress,
    state: Arc<Mutex<BatchState>>,
}

impl BatchContext {
    pub fn progress(&self) -> &SharedProgress {
        &self.progress
    }

    /// Record that the last items have been handed to the pool.
    pub fn all_submitted(&self) {
        set_state(&self.state, BatchState::Draining);
    }
}

/// A batch running on its own thread.
pub struct BatchHandle<T> {
    state: Arc<Mutex<BatchState>>,
    progress: SharedProgress,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> BatchHandle<T> {
    /// Run `job` on a named background thread.
    ///
    /// `job` must own and drop its worker pool before returning, and should
    /// call [`BatchContext::all_submitted`] once its last items are queued.
    /// `cleanup`, when given, runs once after [`CLEANUP_DELAY`].
    pub fn spawn<F>(
        name: &str,
        progress: SharedProgress,
        job: F,
        cleanup: Option<Cleanup>,
    ) -> Result<Self>
    where
        F: FnOnce(BatchContext) -> T + Send + 'static,
    {
        let state = Arc::new(Mutex::new(BatchState::Idle));
        let thread_state = Arc::clone(&state);
        let context = BatchContext {
            progress: progress.clone(),
            state: Arc::clone(&state),
        };
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                set_state(&thread_state, BatchState::Running);
                let output = job(context);
                // A job that stopped early never signalled.
                set_state(&thread_state, BatchState::Draining);
                if let Some(cleanup) = cleanup {
                    thread::sleep(CLEANUP_DELAY);
                    cleanup();
                }
                set_state(&thread_state, BatchState::Completed);
                debug!("batch `{thread_name}` completed");
                output
            })
            .with_context(|| format!("failed to spawn batch thread `{name}`"))?;

        Ok(Self {
            state,
            progress,
            handle,
        })
    }

    pub fn state(&self) -> BatchState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn progress(&self) -> &SharedProgress {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the batch and return its output.
    pub fn join(self) -> Result<T> {
        self.handle
            .join()
            .map_err(|_| anyhow!("batch thread panicked"))
    }
}

fn set_state(state: &Mutex<BatchState>, next: BatchState) {
    *state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn counter_is_shared_between_clones() {
        let progress = SharedProgress::new();
        let other = progress.clone();
        assert_eq!(progress.increment(), 1);
        assert_eq!(other.increment(), 2);
        assert_eq!(progress.get(), 2);
        other.reset();
        assert_eq!(progress.get(), 0);
    }

    #[test]
    fn counter_survives_concurrent_increments() {
        let progress = SharedProgress::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let progress = progress.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        progress.increment();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(progress.get(), 800);
    }

    #[test]
    fn batch_runs_job_then_cleanup_once() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleanups);
        let (tx, rx) = mpsc::channel::<()>();

        let handle = BatchHandle::spawn(
            "test-batch",
            SharedProgress::new(),
            move |ctx| {
                rx.recv().unwrap();
                ctx.progress().increment();
                ctx.progress().increment();
                42
            },
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        assert_ne!(handle.state(), BatchState::Completed);
        tx.send(()).unwrap();

        let progress = handle.progress().clone();
        assert_eq!(handle.join().unwrap(), 42);
        assert_eq!(progress.get(), 2);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_moves_through_states() {
        let (submitted_tx, submitted_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        let handle = BatchHandle::spawn(
            "stateful",
            SharedProgress::new(),
            move |ctx| {
                started_tx.send(()).unwrap();
                submitted_rx.recv().unwrap();
                ctx.all_submitted();
                release_rx.recv().unwrap();
            },
            None,
        )
        .unwrap();

        started_rx.recv().unwrap();
        assert_eq!(handle.state(), BatchState::Running);

        submitted_tx.send(()).unwrap();
        while handle.state() == BatchState::Running {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.state(), BatchState::Draining);

        release_tx.send(()).unwrap();
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state(), BatchState::Completed);
        handle.join().unwrap();
    }

    #[test]
    fn batch_reaches_completed_state() {
        let handle = BatchHandle::spawn("quick", SharedProgress::new(), |_| (), None).unwrap();
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state(), BatchState::Completed);
        handle.join().unwrap();
    }
}
