//! Trailing-edge debouncer with explicit `schedule`/`cancel`/`flush`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Callback fired when a debounced burst settles
pub type DebouncedFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct DebounceState {
    /// Bumped on every schedule; a timer only fires for its own generation
    generation: u64,
    armed: Option<u64>,
    timer: Option<JoinHandle<()>>,
}

/// Coalesces bursts of `schedule` calls into one callback `delay` after the
/// last call. Must be used inside a tokio runtime.
pub struct Debouncer {
    delay: Duration,
    callback: DebouncedFn,
    state: Arc<Mutex<DebounceState>>,
}

fn lock(state: &Mutex<DebounceState>) -> MutexGuard<'_, DebounceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Debouncer {
    pub fn new(delay: Duration, callback: DebouncedFn) -> Self {
        Self {
            delay,
            callback,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// (Re)start the quiet period
    pub fn schedule(&self) {
        let mut state = lock(&self.state);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        state.armed = Some(generation);

        let delay = self.delay;
        let callback = Arc::clone(&self.callback);
        let shared = Arc::clone(&self.state);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fire = {
                let mut state = lock(&shared);
                if state.armed == Some(generation) {
                    state.armed = None;
                    state.timer = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                trace!(generation, "debounce window elapsed");
                callback();
            }
        }));
    }

    /// Drop the pending call, if any
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.armed.take().is_some()
    }

    /// Run the pending call now. Returns whether anything was pending.
    pub fn flush(&self) -> bool {
        if !self.cancel() {
            return false;
        }
        (self.callback)();
        true
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).armed.is_some()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counter() -> (Arc<AtomicUsize>, DebouncedFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (
            count,
            Arc::new(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_fires_once() {
        let (count, callback) = counter();
        let debouncer = Debouncer::new(Duration::from_millis(500), callback);

        for _ in 0..5 {
            debouncer.schedule();
            sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        sleep(Duration::from_millis(450)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_immediately_and_once() {
        let (count, callback) = counter();
        let debouncer = Debouncer::new(Duration::from_millis(500), callback);

        debouncer.schedule();
        assert!(debouncer.flush());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_call() {
        let (count, callback) = counter();
        let debouncer = Debouncer::new(Duration::from_millis(500), callback);

        debouncer.schedule();
        assert!(debouncer.cancel());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!debouncer.cancel());
    }
}
