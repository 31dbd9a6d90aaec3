//! Synchronisation primitives backing the `lapin` implementation of the transport traits.
use std::sync::Arc;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};

/// Latches the first error reported by a `lapin` error callback and wakes up everybody
/// waiting for it.
#[derive(Clone)]
pub(crate) struct FaultSignal(Arc<watch::Sender<Option<lapin::Error>>>);

impl FaultSignal {
    pub(crate) fn new() -> Self {
        Self(Arc::new(watch::channel(None).0))
    }

    /// Only the first fault is kept: later ones are usually consequences of it.
    pub(crate) fn raise(&self, error: lapin::Error) {
        self.0.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(error);
            true
        });
    }

    pub(crate) async fn wait(&self) -> lapin::Error {
        let mut receiver = self.0.subscribe();
        loop {
            if let Some(error) = receiver.borrow_and_update().clone() {
                return error;
            }
            // The sender lives as long as `self`: `changed` cannot fail here.
            if receiver.changed().await.is_err() {
                futures_util::future::pending::<()>().await;
            }
        }
    }
}

/// Bounds the number of published messages waiting for a broker confirmation.
///
/// A [`WriteSlot`] is held for every message in flight; when none is left the channel
/// reports that its write buffer is full.
pub(crate) struct WriteWindow {
    permits: Arc<Semaphore>,
    drained: Arc<Notify>,
}

pub(crate) struct WriteSlot {
    permit: Option<OwnedSemaphorePermit>,
    drained: Arc<Notify>,
}

impl WriteWindow {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            drained: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn try_reserve(&self) -> Option<WriteSlot> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        Some(WriteSlot {
            permit: Some(permit),
            drained: Arc::clone(&self.drained),
        })
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.permits.available_permits() > 0
    }

    /// Resolves after a slot has been released.
    ///
    /// A release that happened while nobody was waiting is remembered, so this may resolve
    /// spuriously: check [`WriteWindow::has_capacity`] afterwards.
    pub(crate) async fn released(&self) {
        self.drained.notified().await
    }
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        // Give the permit back before waking anybody up.
        drop(self.permit.take());
        self.drained.notify_one();
    }
}
