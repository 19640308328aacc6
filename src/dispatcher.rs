//! Caller-side bookkeeping: the pending-call table and the reply future.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::envelope::ErrorPayload;
use crate::error::CallError;

pub(crate) type Outcome = Result<Value, CallError>;

struct PendingCall {
    name: String,
    /// Set once the `methodcall` is on the wire.
    sent: bool,
    reply: oneshot::Sender<Outcome>,
    timer: JoinHandle<()>,
}

/// Outstanding calls keyed by `callId`.
///
/// An entry leaves the table exactly once: on return, throw, timeout, or
/// close. Anything arriving for an id that is no longer here is ignored, which
/// makes settlement idempotent.
#[derive(Default)]
pub(crate) struct PendingCalls {
    entries: HashMap<String, PendingCall>,
}

impl PendingCalls {
    pub(crate) fn insert(
        &mut self,
        call_id: String,
        name: String,
        reply: oneshot::Sender<Outcome>,
        timer: JoinHandle<()>,
    ) {
        let prev = self.entries.insert(
            call_id,
            PendingCall {
                name,
                sent: false,
                reply,
                timer,
            },
        );
        debug_assert!(prev.is_none(), "callId reused while outstanding");
    }

    pub(crate) fn contains(&self, call_id: &str) -> bool {
        self.entries.contains_key(call_id)
    }

    pub(crate) fn mark_sent(&mut self, call_id: &str) {
        if let Some(entry) = self.entries.get_mut(call_id) {
            entry.sent = true;
        }
    }

    /// Whether `call_id` is outstanding and was actually sent to the peer.
    pub(crate) fn is_sent(&self, call_id: &str) -> bool {
        self.entries.get(call_id).is_some_and(|p| p.sent)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn name_of(&self, call_id: &str) -> Option<&str> {
        self.entries.get(call_id).map(|p| p.name.as_str())
    }

    /// Resolve with a returned value. Returns `false` if `call_id` is unknown.
    pub(crate) fn resolve(&mut self, call_id: &str, value: Value) -> bool {
        self.settle(call_id, |_| Ok(value))
    }

    /// Reject with a thrown error, mapping the callee's unsupported-method
    /// throw back to [`CallError::UnsupportedMethod`].
    pub(crate) fn reject_remote(&mut self, call_id: &str, error: ErrorPayload) -> bool {
        self.settle(call_id, |name| {
            if error.is_unsupported_method() {
                Err(CallError::UnsupportedMethod {
                    name: name.to_string(),
                })
            } else {
                Err(CallError::Remote {
                    message: error.message,
                    stack: error.stack,
                })
            }
        })
    }

    /// Fired by the call's own timer.
    pub(crate) fn expire(&mut self, call_id: &str) -> bool {
        let Some(entry) = self.entries.remove(call_id) else {
            return false;
        };
        let _ = entry.reply.send(Err(CallError::CallTimeout {
            call_id: call_id.to_string(),
            name: entry.name,
        }));
        true
    }

    pub(crate) fn reject(&mut self, call_id: &str, error: CallError) -> bool {
        self.settle(call_id, |_| Err(error))
    }

    /// Reject every entry and empty the table. Returns how many were rejected.
    pub(crate) fn reject_all(&mut self, error: &CallError) -> usize {
        let drained: Vec<_> = self.entries.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry.reply.send(Err(error.clone()));
        }
        count
    }

    fn settle(&mut self, call_id: &str, outcome: impl FnOnce(&str) -> Outcome) -> bool {
        let Some(entry) = self.entries.remove(call_id) else {
            return false;
        };
        entry.timer.abort();
        // The caller may have dropped its PendingReply; that is not an error.
        let _ = entry.reply.send(outcome(&entry.name));
        true
    }
}

enum ReplyState {
    Settled(Option<Outcome>),
    Waiting(oneshot::Receiver<Outcome>),
}

/// The eventual result of [`Channel::invoke`](crate::Channel::invoke).
///
/// The call is registered (and sent, or buffered) before this value is
/// returned; awaiting it only waits for the outcome.
#[must_use = "the outcome of a remote call is only observable by awaiting its reply"]
pub struct PendingReply {
    call_id: Option<String>,
    state: ReplyState,
}

impl PendingReply {
    pub(crate) fn settled(outcome: Outcome) -> Self {
        Self {
            call_id: None,
            state: ReplyState::Settled(Some(outcome)),
        }
    }

    pub(crate) fn waiting(call_id: String, rx: oneshot::Receiver<Outcome>) -> Self {
        Self {
            call_id: Some(call_id),
            state: ReplyState::Waiting(rx),
        }
    }

    /// `None` when the call failed locally and never got an id.
    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }
}

impl Future for PendingReply {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            ReplyState::Settled(slot) => {
                Poll::Ready(slot.take().unwrap_or(Err(CallError::ChannelClosed)))
            }
            ReplyState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(CallError::ChannelClosed))),
        }
    }
}
