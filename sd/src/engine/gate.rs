//! Pause gate
//!
//! A closable synchronisation primitive gating cycle progress. The cycle
//! controller owns the control side; the workflow engine holds a gate and
//! checks it at every group boundary. Closed state carries the pause
//! reason.

use tokio::sync::watch;

/// Create a gate pair; gates start open
pub fn pause_gate() -> (PauseControl, PauseGate) {
    let (tx, rx) = watch::channel(None);
    (PauseControl { tx }, PauseGate { rx })
}

/// Control side: close and reopen the gate
pub struct PauseControl {
    tx: watch::Sender<Option<String>>,
}

impl PauseControl {
    pub fn close(&self, reason: impl Into<String>) {
        // send_replace: the state must stick even while no cycle (and thus
        // no gate receiver) is alive
        self.tx.send_replace(Some(reason.into()));
    }

    pub fn open(&self) {
        self.tx.send_replace(None);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Hand out a gate for a new cycle task
    pub fn gate(&self) -> PauseGate {
        PauseGate {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side: checked at group boundaries, awaited on resume
#[derive(Clone)]
pub struct PauseGate {
    rx: watch::Receiver<Option<String>>,
}

impl PauseGate {
    /// The pause reason when closed, None when open
    pub fn closed_reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolve once the gate is open
    ///
    /// Returns immediately when already open. Resolves (rather than hangs)
    /// if the control side is dropped, so a dying controller cannot strand
    /// waiters.
    pub async fn wait_open(&mut self) {
        loop {
            if self.rx.borrow_and_update().is_none() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gate_starts_open() {
        let (control, gate) = pause_gate();
        assert!(!gate.is_closed());
        assert!(!control.is_closed());
        assert!(gate.closed_reason().is_none());
    }

    #[test]
    fn test_close_carries_reason() {
        let (control, gate) = pause_gate();
        control.close("EODHD_DAILY_LIMIT");
        assert!(gate.is_closed());
        assert_eq!(gate.closed_reason().as_deref(), Some("EODHD_DAILY_LIMIT"));

        control.open();
        assert!(!gate.is_closed());
    }

    #[test]
    fn test_state_sticks_without_receivers() {
        let (control, gate) = pause_gate();
        drop(gate);

        // Closing with no live gates must still stick for the next cycle
        control.close("maintenance");
        assert!(control.gate().is_closed());

        control.open();
        assert!(!control.gate().is_closed());
    }

    #[tokio::test]
    async fn test_wait_open_immediate() {
        let (_control, mut gate) = pause_gate();
        // Completes without yield when open
        tokio::time::timeout(Duration::from_millis(10), gate.wait_open())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_open_wakes_on_open() {
        let (control, mut gate) = pause_gate();
        control.close("maintenance");

        let waiter = tokio::spawn(async move {
            gate.wait_open().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.open();
        tokio::time::timeout(Duration::from_millis(100), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_open_unblocks_on_drop() {
        let (control, mut gate) = pause_gate();
        control.close("maintenance");
        drop(control);
        tokio::time::timeout(Duration::from_millis(100), gate.wait_open())
            .await
            .unwrap();
    }
}
