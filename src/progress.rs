use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Progress reporting context passed into long-running operations
///
/// Implementations must be `Sync`: parallel loops call [`Progress::advance`] from worker threads.
pub trait Progress: Sync {
    /// A new stage with `total` units of work begins
    fn begin(&self, stage: &str, total: usize);
    /// `n` more units of the current stage are done
    fn advance(&self, n: usize);
    /// The current stage is finished
    fn end(&self);
}

/// Discards all progress information
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn begin(&self, _stage: &str, _total: usize) {}
    fn advance(&self, _n: usize) {}
    fn end(&self) {}
}

/// Forwards stage boundaries to `tracing` and counts completed work
///
/// A `debug!` event is emitted every time another `step` percent of the stage is done.
#[derive(Debug)]
pub struct TracingProgress {
    stage: Mutex<String>,
    total: AtomicUsize,
    done: AtomicUsize,
    step: usize,
}

impl TracingProgress {
    pub fn new() -> Self {
        Self::with_step(25)
    }

    /// Report every `step_percent` percent (clamped to 1..=100)
    pub fn with_step(step_percent: usize) -> Self {
        Self {
            stage: Mutex::new(String::new()),
            total: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            step: step_percent.clamp(1, 100),
        }
    }

    /// Units of work completed in the current stage
    pub fn completed(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    fn stage_name(&self) -> String {
        self.stage
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Default for TracingProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for TracingProgress {
    fn begin(&self, stage: &str, total: usize) {
        match self.stage.lock() {
            Ok(mut s) => *s = stage.to_owned(),
            Err(poisoned) => *poisoned.into_inner() = stage.to_owned(),
        }
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        tracing::info!(stage, total, "stage started");
    }

    fn advance(&self, n: usize) {
        let before = self.done.fetch_add(n, Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return;
        }
        let after = before + n;
        let pct_before = before * 100 / total;
        let pct_after = after.min(total) * 100 / total;
        if pct_after / self.step > pct_before / self.step {
            tracing::debug!(stage = %self.stage_name(), percent = pct_after, "progress");
        }
    }

    fn end(&self) {
        tracing::info!(
            stage = %self.stage_name(),
            done = self.done.load(Ordering::Relaxed),
            "stage finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn tracing_progress_counts_parallel_work() {
        let progress = TracingProgress::with_step(10);
        progress.begin("count", 1000);
        (0..1000).into_par_iter().for_each(|_| progress.advance(1));
        progress.end();
        assert_eq!(progress.completed(), 1000);
    }

    #[test]
    fn begin_resets_counter() {
        let progress = TracingProgress::new();
        progress.begin("a", 4);
        progress.advance(4);
        progress.begin("b", 2);
        assert_eq!(progress.completed(), 0);
    }
}
