//! At most one retention run per process.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::StopError;

/// The active run, as seen by the guard.
struct RunInstance {
    id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct GuardState {
    runner: Option<RunInstance>,
    next_id: u64,
}

/// Single-slot run guard.
///
/// [`start`](Self::start) claims the slot and hands back a [`RunHandle`];
/// the slot stays claimed until that handle is dropped, even if a
/// [`stop`](Self::stop) timed out in the meantime.
#[derive(Clone, Default)]
pub struct SingleFlightGuard {
    state: Arc<Mutex<GuardState>>,
}

impl SingleFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a new run. Returns `None` if a run is active.
    pub fn start(&self) -> Option<RunHandle> {
        let mut state = self.state.lock();
        if let Some(active) = &state.runner {
            tracing::warn!(
                active_run = active.id,
                "Multiple retention runs requested concurrently; there can be only one"
            );
            return None;
        }

        state.next_id += 1;
        let id = state.next_id;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        state.runner = Some(RunInstance {
            id,
            cancel: cancel.clone(),
            done: done_rx,
        });

        Some(RunHandle {
            id,
            cancel,
            done: done_tx,
            state: Arc::clone(&self.state),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().runner.is_some()
    }

    /// Cancel the active run and wait up to `timeout` for it to exit.
    ///
    /// Returns immediately when nothing is running. On timeout the run keeps
    /// going and keeps its slot.
    pub async fn stop(&self, timeout: Duration) -> Result<(), StopError> {
        let (cancel, mut done) = {
            let state = self.state.lock();
            match &state.runner {
                Some(run) => (run.cancel.clone(), run.done.clone()),
                None => return Ok(()),
            }
        };

        cancel.cancel();

        let exited = async move {
            loop {
                if *done.borrow_and_update() {
                    return;
                }
                // Sender gone means the handle was dropped
                if done.changed().await.is_err() {
                    return;
                }
            }
        };

        tokio::time::timeout(timeout, exited)
            .await
            .map_err(|_| StopError::Timeout(timeout))
    }
}

/// Ownership of the run slot. Dropping it frees the slot and then signals
/// anyone waiting in [`SingleFlightGuard::stop`].
pub struct RunHandle {
    id: u64,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    state: Arc<Mutex<GuardState>>,
}

impl RunHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token cancelled by [`SingleFlightGuard::stop`].
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock();
            if state.runner.as_ref().is_some_and(|r| r.id == self.id) {
                state.runner = None;
            }
        }
        self.done.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_start_rejected_until_first_ends() {
        let guard = SingleFlightGuard::new();

        let first = guard.start().expect("first run starts");
        assert!(guard.is_running());
        assert!(guard.start().is_none());

        drop(first);
        assert!(!guard.is_running());

        let second = guard.start().expect("slot is free again");
        assert_ne!(second.id(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_run_is_ok() {
        let guard = SingleFlightGuard::new();
        assert!(guard.stop(Duration::from_millis(10)).await.is_ok());
        assert!(guard.stop(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_cancels_and_waits() {
        let guard = SingleFlightGuard::new();
        let handle = guard.start().unwrap();

        let run = tokio::spawn(async move {
            handle.cancellation_token().cancelled().await;
            drop(handle);
        });

        guard.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!guard.is_running());
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_stop_keeps_slot() {
        let guard = SingleFlightGuard::new();
        let handle = guard.start().unwrap();

        let err = guard.stop(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, StopError::Timeout(Duration::from_secs(1)));
        assert!(handle.cancellation_token().is_cancelled());

        // Still occupied by the run that ignored cancellation
        assert!(guard.is_running());
        assert!(guard.start().is_none());

        drop(handle);
        assert!(guard.start().is_some());
    }

    #[tokio::test]
    async fn test_clones_share_the_slot() {
        let guard = SingleFlightGuard::new();
        let other = guard.clone();

        let _handle = guard.start().unwrap();
        assert!(other.start().is_none());
        assert!(other.is_running());
    }
}
