//! Core server lifecycle functionality
//!
//! This module provides:
//! - Cooperative shutdown signalling shared by the socket pool and the
//!   main wait loop
//! - In-flight receive accounting used for the shutdown drain barrier

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown state. Receive tasks watch `quit_requested`; the run
/// loop blocks on `notify` and then waits for `pending_receives` to drain
/// before the process may exit.
pub struct ShutdownState {
    quit_requested: AtomicBool,
    pending_receives: AtomicUsize,
    notify: Notify,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            quit_requested: AtomicBool::new(false),
            pending_receives: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Request shutdown and wake anything blocked on `wait_for_quit`.
    pub fn request_quit(&self) {
        self.quit_requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested.load(Ordering::SeqCst)
    }

    /// Block until a quit has been requested.
    pub async fn wait_for_quit(&self) {
        loop {
            // Register for the notification before re-checking the flag;
            // a quit landing between the check and the registration would
            // otherwise never wake this waiter.
            let notified = self.notify.notified();
            if self.quit_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Account for one posted receive. Returns false if shutdown already
    /// started and the receive must not be posted.
    pub fn begin_receive(&self) -> bool {
        if self.quit_requested() {
            return false;
        }
        self.pending_receives.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn end_receive(&self) {
        self.pending_receives.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn pending_receives(&self) -> usize {
        self.pending_receives.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe shared shutdown state.
pub type SharedShutdownState = Arc<ShutdownState>;

pub fn create_shutdown_state() -> SharedShutdownState {
    Arc::new(ShutdownState::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_flag() {
        let state = ShutdownState::new();
        assert!(!state.quit_requested());
        state.request_quit();
        assert!(state.quit_requested());
    }

    #[test]
    fn test_receive_accounting() {
        let state = ShutdownState::new();
        assert!(state.begin_receive());
        assert!(state.begin_receive());
        assert_eq!(state.pending_receives(), 2);
        state.end_receive();
        assert_eq!(state.pending_receives(), 1);
    }

    #[test]
    fn test_no_new_receives_after_quit() {
        let state = ShutdownState::new();
        state.request_quit();
        assert!(!state.begin_receive());
        assert_eq!(state.pending_receives(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_for_quit_concurrent_request() {
        // A quit racing the waiter's registration must still wake it;
        // there is no later notification on an idle server.
        for _ in 0..200 {
            let state = create_shutdown_state();
            let waiter = {
                let state = Arc::clone(&state);
                tokio::spawn(async move { state.wait_for_quit().await })
            };
            let quitter = {
                let state = Arc::clone(&state);
                tokio::spawn(async move { state.request_quit() })
            };
            tokio::time::timeout(std::time::Duration::from_secs(5), async {
                waiter.await.unwrap();
                quitter.await.unwrap();
            })
            .await
            .expect("waiter must observe the quit");
        }
    }

    #[tokio::test]
    async fn test_wait_for_quit_wakes() {
        let state = create_shutdown_state();
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_for_quit().await })
        };
        tokio::task::yield_now().await;
        state.request_quit();
        waiter.await.unwrap();
    }
}
