//! Fixed-size worker pool with ordered, chunked result delivery.

use std::num::NonZeroUsize;
use std::thread;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use thiserror::Error;

/// Items submitted to the pool at a time. Results of a chunk are delivered
/// before the next chunk is dispatched.
pub const CHUNK_SIZE: usize = 15;

/// Threads used to compose emails.
pub const COMPOSE_THREADS: usize = 5;

#[derive(Debug, Error)]
#[error("failed to start worker pool: {0}")]
pub struct PoolError(#[from] ThreadPoolBuildError);

pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    pub fn new(threads: usize, name: &'static str) -> Result<Self, PoolError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(move |i| format!("{name}-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    /// One thread per core, leaving one for the caller.
    pub fn for_rendering() -> Result<Self, PoolError> {
        Self::new(render_threads(), "render")
    }

    pub fn for_composing() -> Result<Self, PoolError> {
        Self::new(COMPOSE_THREADS, "compose")
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `work` over `items` in chunks of [`CHUNK_SIZE`] and hand every
    /// result to `sink` in submission order.
    ///
    /// An error from `sink` stops the batch: no further chunk is dispatched
    /// and the error is returned.
    pub fn map_ordered<T, R, E, W, S>(&self, items: &[T], work: W, sink: S) -> Result<(), E>
    where
        T: Sync,
        R: Send,
        W: Fn(&T) -> R + Sync,
        S: FnMut(&T, R) -> Result<(), E>,
    {
        self.map_ordered_with(items, work, sink, || {})
    }

    /// [`map_ordered`](Self::map_ordered), calling `all_submitted` once just
    /// before the last chunk is dispatched. An empty batch calls it at once;
    /// a batch stopped early never does.
    pub fn map_ordered_with<T, R, E, W, S, D>(
        &self,
        items: &[T],
        work: W,
        mut sink: S,
        all_submitted: D,
    ) -> Result<(), E>
    where
        T: Sync,
        R: Send,
        W: Fn(&T) -> R + Sync,
        S: FnMut(&T, R) -> Result<(), E>,
        D: FnOnce(),
    {
        let mut all_submitted = Some(all_submitted);
        let chunks = items.chunks(CHUNK_SIZE);
        let last = chunks.len().saturating_sub(1);
        if items.is_empty() {
            if let Some(signal) = all_submitted.take() {
                signal();
            }
        }
        for (position, chunk) in chunks.enumerate() {
            if position == last {
                if let Some(signal) = all_submitted.take() {
                    signal();
                }
            }
            let results: Vec<R> = self
                .pool
                .install(|| chunk.par_iter().map(|item| work(item)).collect());
            for (item, result) in chunk.iter().zip(results) {
                sink(item, result)?;
            }
        }
        Ok(())
    }
}

pub fn render_threads() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}
