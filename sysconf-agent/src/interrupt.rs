use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use tokio::sync::Notify;

/// Set once SIGINT or SIGTERM arrives. The supervisor stops reading from
/// the store; nothing in flight is cancelled.
#[derive(Clone, Debug, Default)]
pub struct InterruptState {
    interrupted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Resolves once [`set_interrupted`](Self::set_interrupted) has been called.
    pub async fn interrupted(&self) {
        loop {
            // Register before checking, so a concurrent set is not missed
            let notified = self.notify.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

fn set_process_interrupt_handler(interrupted: &InterruptState) -> Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted.set_interrupted();
    })
    .context("setting interrupt handler")
}

pub fn set_up_process_interrupt_handler() -> Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupted_wakes_waiter() {
        let state = InterruptState::new();
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.interrupted().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        state.set_interrupted();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already interrupted: returns immediately
        state.interrupted().await;
    }
}
