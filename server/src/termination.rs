//! Per-session cancellation shared by the receiver, sender and processor.
//!
//! Three nested tokens cover the ways a session can stop:
//!
//! - `force_exit` models an unrecoverable invariant violation. Cancelling it
//!   cancels everything below.
//! - `session` is the mutual termination token. Any task of the session
//!   returning fires it, which stops the other two.
//! - `stop_send` only stops the sender, e.g. when the slot is recycled.
//!
//! The processor pool does not observe the tokens' session semantics; the
//! receiver forwards a plain boolean flag to it when it exits.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug)]
pub struct Termination {
    force_exit: CancellationToken,
    session: CancellationToken,
    stop_send: CancellationToken,
    processor_flag: watch::Sender<bool>,
}

impl Termination {
    pub fn new() -> Self {
        let force_exit = CancellationToken::new();
        let session = force_exit.child_token();
        let stop_send = session.child_token();
        let (processor_flag, _) = watch::channel(false);

        Self {
            force_exit,
            session,
            stop_send,
            processor_flag,
        }
    }

    /// Fires the mutual termination signal. Idempotent.
    pub fn fire(&self) {
        self.session.cancel();
    }

    pub fn force_exit(&self) {
        self.force_exit.cancel();
    }

    pub fn stop_send(&self) {
        self.stop_send.cancel();
    }

    /// Raises the boolean flag observed by the paired processor
    pub fn notify_processor(&self) {
        self.processor_flag.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        self.session.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.force_exit.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.session.cancelled()
    }

    pub fn forced(&self) -> WaitForCancellationFuture<'_> {
        self.force_exit.cancelled()
    }

    pub fn send_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stop_send.cancelled()
    }

    pub fn subscribe_processor(&self) -> watch::Receiver<bool> {
        self.processor_flag.subscribe()
    }

    /// Guard that fires the session when the owning task returns or unwinds.
    /// With `forward` set it also raises the processor flag.
    pub fn guard(self: &Arc<Self>, forward: bool) -> TerminationGuard {
        TerminationGuard {
            termination: Arc::clone(self),
            forward,
        }
    }
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TerminationGuard {
    termination: Arc<Termination>,
    forward: bool,
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        self.termination.fire();
        if self.forward {
            self.termination.notify_processor();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_fire_is_idempotent() {
        let termination = Termination::new();
        termination.fire();
        termination.fire();

        assert!(termination.is_fired());
        assert!(!termination.is_forced());
    }

    #[test]
    fn test_force_exit_cascades() {
        let termination = Termination::new();
        termination.force_exit();

        assert!(termination.is_forced());
        assert!(termination.is_fired());
        assert!(termination.stop_send.is_cancelled());
    }

    #[test]
    fn test_stop_send_is_local() {
        let termination = Termination::new();
        termination.stop_send();

        assert!(termination.stop_send.is_cancelled());
        assert!(!termination.is_fired());
    }

    #[tokio::test]
    async fn test_guard_fires_on_drop() {
        let termination = Arc::new(Termination::new());
        let mut flag = termination.subscribe_processor();

        let task = {
            let termination = Arc::clone(&termination);
            tokio::spawn(async move {
                let _guard = termination.guard(true);
            })
        };
        task.await.unwrap();

        assert!(termination.is_fired());
        timeout(Duration::from_secs(1), flag.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*flag.borrow());
    }

    #[tokio::test]
    async fn test_all_waiters_are_notified() {
        let termination = Arc::new(Termination::new());
        let mut waiters = Vec::new();

        for _ in 0..3 {
            let termination = Arc::clone(&termination);
            waiters.push(tokio::spawn(async move {
                termination.cancelled().await;
            }));
        }

        termination.fire();
        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        }
    }

    #[test]
    fn test_guard_without_forwarding_leaves_flag() {
        let termination = Arc::new(Termination::new());
        let flag = termination.subscribe_processor();

        drop(termination.guard(false));

        assert!(termination.is_fired());
        assert!(!*flag.borrow());
    }
}
