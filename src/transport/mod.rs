//! Transport abstraction.
//!
//! A channel needs two primitives from whatever carries its messages: a way to
//! send one JSON value to the peer, and a stream of JSON values received from
//! it. The stream ending means the transport was torn down (frame unloaded,
//! process exited, pipe closed).

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod memory;
#[cfg(feature = "stream")]
pub mod stream;

/// Messages received from the peer, in transport delivery order.
pub type Incoming = mpsc::UnboundedReceiver<Value>;

/// Outbound half of a transport.
///
/// `send` is called from the channel's event handlers and must not block;
/// implementations queue the message and return.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, message: Value) -> Result<(), TransportError>;

    /// Release the outbound half. Called once when the channel closes.
    fn close(&self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, message: Value) -> Result<(), TransportError> {
        (**self).send(message)
    }

    fn close(&self) {
        (**self).close()
    }
}
