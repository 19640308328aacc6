//! In-process transport pair.
//!
//! Each end's sender feeds the other end's [`Incoming`]. Closing (or dropping)
//! one sender ends the opposite stream, which the peer channel observes as
//! transport teardown.

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Incoming, Transport};
use crate::error::TransportError;

pub struct MemorySender {
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl Transport for MemorySender {
    fn send(&self, message: Value) -> Result<(), TransportError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// One side of a [`pair`].
pub struct MemoryEnd {
    pub sender: MemorySender,
    pub incoming: Incoming,
}

impl MemoryEnd {
    pub fn into_parts(self) -> (MemorySender, Incoming) {
        (self.sender, self.incoming)
    }
}

/// Two connected ends: whatever one sends, the other receives.
pub fn pair() -> (MemoryEnd, MemoryEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = MemoryEnd {
        sender: MemorySender {
            tx: Mutex::new(Some(b_tx)),
        },
        incoming: a_rx,
    };
    let b = MemoryEnd {
        sender: MemorySender {
            tx: Mutex::new(Some(a_tx)),
        },
        incoming: b_rx,
    };
    (a, b)
}
