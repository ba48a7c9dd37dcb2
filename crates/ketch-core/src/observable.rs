//! Observable state cells (§6.5, §9 Design Notes "Observable cells"):
//! latest-value, coalesced, broadcast to many readers. `tokio::sync::watch`
//! already has exactly this semantics, generalized here from a control
//! signal to a generic published value.

use tokio::sync::watch;

/// A value republished on every update; cloned out by readers rather than
/// locked, so a slow reader never blocks the publisher and only ever sees
/// the latest value (older updates are coalesced away).
pub struct Cell<T> {
    tx: watch::Sender<T>,
}

/// A read-only view onto a `Cell<T>`, handed out to observers.
pub struct CellReader<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone + PartialEq> Cell<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn reader(&self) -> CellReader<T> {
        CellReader { rx: self.tx.subscribe() }
    }
}

impl<T: Clone> CellReader<T> {
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Waits for the next published value different from the one last
    /// observed by this reader.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow().clone())
    }
}

impl<T> Clone for CellReader<T> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone() }
    }
}
