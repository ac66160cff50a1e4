//! Single-assignment result slot
//!
//! Several parties may race to produce an outcome (native completion, a
//! stop request, a timer). The first `complete` wins; later ones are
//! no-ops and report `false`.

use parking_lot::Mutex;
use tokio::sync::oneshot;

pub struct ResultSlot<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> ResultSlot<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Fill the slot. Returns true only for the call that won.
    pub fn complete(&self, value: T) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                // A dropped receiver still counts as assigned
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.sender.lock().is_none()
    }
}
