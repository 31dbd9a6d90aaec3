use crate::connection::error::ConnectionError;
use crate::sync::lock;
use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};

/// Signals that a channel has become usable.
///
/// Waiters are one-shot: each firing wakes up every waiter registered so far, in
/// registration order, and forgets about them. Waiting for the following firing requires
/// registering again.
///
/// Application code can also follow every firing as a `ready` event through
/// [`Readiness::subscribe`].
pub struct Readiness {
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
    events: broadcast::Sender<()>,
}

/// A registration for the next firing of a [`Readiness`] signal.
#[must_use = "a waiter does nothing unless awaited"]
pub struct ReadyWaiter(oneshot::Receiver<()>);

impl ReadyWaiter {
    /// Fails if the signal was abandoned (e.g. the connection was closed) before firing.
    pub async fn wait(self) -> Result<(), ConnectionError> {
        self.0.await.map_err(|_| ConnectionError::Closed)
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            events: broadcast::channel(16).0,
        }
    }
}

impl Readiness {
    /// Register interest in the next firing.
    pub fn next(&self) -> ReadyWaiter {
        let (sender, receiver) = oneshot::channel();
        let mut waiters = lock(&self.waiters);
        // Waiters given up on by their owner (e.g. the losing branch of a `select!`).
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(sender);
        ReadyWaiter(receiver)
    }

    /// A new receiver for `ready` events.
    ///
    /// Only firings that happen after the call are observed.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.events.subscribe()
    }

    /// Wake up every pending waiter and emit a `ready` event.
    pub(crate) fn fire(&self) {
        let waiters = std::mem::take(&mut *lock(&self.waiters));
        for waiter in waiters {
            let _ = waiter.send(());
        }
        // Nobody listening is fine.
        let _ = self.events.send(());
    }

    /// Drop every pending waiter: they resolve with [`ConnectionError::Closed`].
    pub(crate) fn abandon(&self) {
        lock(&self.waiters).clear();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        lock(&self.waiters).len()
    }
}
