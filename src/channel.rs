//! One handshake-negotiated channel between a host and an embedded tool.
//!
//! ```text
//!  Connecting ──► Handshaking ──► Ready ──► Closed
//!                     │                       ▲
//!                     └──────► Degraded ──────┘
//! ```
//!
//! A driver task consumes the transport's incoming stream; per-call timers
//! and the handshake timer are separate tasks. All of them mutate the
//! channel through one lock, and none of them hold it across an await.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::capability::CapabilityTable;
use crate::config::ChannelConfig;
use crate::dispatcher::{PendingCalls, PendingReply};
use crate::envelope::{Envelope, MethodDescriptor};
use crate::error::{CallError, ConfigError, TransportError};
use crate::transport::{Incoming, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Held inside [`Channel::open`] until our handshake is on the wire.
    Connecting,
    Handshaking,
    Ready,
    /// The peer never announced its capabilities; every call fails fast.
    Degraded,
    Closed,
}

impl ChannelState {
    fn is_negotiating(self) -> bool {
        matches!(self, Self::Connecting | Self::Handshaking)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

struct QueuedCall {
    call_id: String,
    name: String,
    args: Vec<Value>,
}

struct Inner {
    state: ChannelState,
    peer_methods: Vec<String>,
    peer_path: Option<String>,
    pending: PendingCalls,
    /// Our calls issued before the peer's handshake, in issuance order.
    outbox: VecDeque<QueuedCall>,
    /// Peer calls received before the peer's handshake, in arrival order.
    inbox: VecDeque<QueuedCall>,
    /// Returns and throws received before the peer's handshake.
    early_replies: Vec<Envelope>,
    /// Ids of peer calls buffered or running and not yet answered.
    serving: HashSet<String>,
    handshake_timer: Option<JoinHandle<()>>,
    driver: Option<JoinHandle<()>>,
}

impl Inner {
    fn peer_supports(&self, name: &str) -> bool {
        self.peer_methods.iter().any(|m| m == name)
    }
}

struct Shared {
    transport: Box<dyn Transport>,
    capabilities: CapabilityTable,
    config: ChannelConfig,
    next_call_id: AtomicU64,
    state_tx: watch::Sender<ChannelState>,
    inner: Mutex<Inner>,
}

/// Handle to an open channel. Cheap to clone; all clones share one channel,
/// and dropping the last clone closes it.
#[derive(Clone)]
pub struct Channel {
    handle: Arc<Handle>,
}

/// Owned only by [`Channel`] clones. Background tasks hold `Shared` directly,
/// so this drops exactly when the user lets go of the channel.
struct Handle {
    shared: Arc<Shared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        self.shared.close_locked(&mut inner, "last handle dropped");
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Channel {
    /// Open a channel over an established transport.
    ///
    /// Sends our handshake immediately and starts waiting for the peer's.
    /// Fails only if `config` does not validate; a failed handshake send
    /// yields a channel that is already closed. Must be called from within a
    /// tokio runtime.
    pub fn open<T: Transport>(
        transport: T,
        incoming: Incoming,
        capabilities: CapabilityTable,
        config: ChannelConfig,
    ) -> Result<Channel, ConfigError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        let shared = Arc::new(Shared {
            transport: Box::new(transport),
            capabilities,
            config,
            next_call_id: AtomicU64::new(1),
            state_tx,
            inner: Mutex::new(Inner {
                state: ChannelState::Connecting,
                peer_methods: Vec::new(),
                peer_path: None,
                pending: PendingCalls::default(),
                outbox: VecDeque::new(),
                inbox: VecDeque::new(),
                early_replies: Vec::new(),
                serving: HashSet::new(),
                handshake_timer: None,
                driver: None,
            }),
        });

        {
            let mut inner = shared.inner.lock();
            let handshake = Envelope::Handshake {
                path: shared.config.path.clone(),
                supported_methods: shared.capabilities.descriptors(),
            };
            if let Err(e) = shared.transmit(&handshake) {
                tracing::warn!(error = %e, "failed to send handshake");
                shared.close_locked(&mut inner, "handshake send failed");
                drop(inner);
                return Ok(Channel::from_shared(shared));
            }
            shared.set_state(&mut inner, ChannelState::Handshaking);
            tracing::debug!(
                methods = shared.capabilities.descriptors().len(),
                "handshake sent"
            );

            let weak = Arc::downgrade(&shared);
            let timeout = shared.config.handshake_timeout();
            inner.handshake_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(shared) = weak.upgrade() {
                    shared.on_handshake_timeout();
                }
            }));
            inner.driver = Some(tokio::spawn(drive(Arc::clone(&shared), incoming)));
        }

        Ok(Channel::from_shared(shared))
    }

    fn from_shared(shared: Arc<Shared>) -> Channel {
        Channel {
            handle: Arc::new(Handle { shared }),
        }
    }

    /// Call `name` on the peer.
    ///
    /// Never blocks: the call is sent (or buffered until the peer's handshake
    /// arrives) before this returns, and the returned future settles with the
    /// outcome. Calls the peer did not advertise fail without touching the
    /// transport.
    pub fn invoke(&self, name: impl Into<String>, args: Vec<Value>) -> PendingReply {
        let name = name.into();
        let shared = &self.handle.shared;
        let mut inner = shared.inner.lock();

        let state = inner.state;
        match state {
            ChannelState::Closed => return PendingReply::settled(Err(CallError::ChannelClosed)),
            ChannelState::Degraded => {
                return PendingReply::settled(Err(CallError::HandshakeTimeout))
            }
            ChannelState::Ready if !inner.peer_supports(&name) => {
                tracing::debug!(method = %name, "peer does not advertise method");
                return PendingReply::settled(Err(CallError::UnsupportedMethod { name }));
            }
            _ => {}
        }

        let call_id = shared.next_call_id();
        let (tx, rx) = oneshot::channel();
        let timer = shared.spawn_call_timer(call_id.clone());
        inner
            .pending
            .insert(call_id.clone(), name.clone(), tx, timer);
        tracing::debug!(%call_id, method = %name, %state, "registered call");

        if state == ChannelState::Ready {
            let call = Envelope::MethodCall {
                call_id: call_id.clone(),
                name,
                args,
            };
            match shared.transmit(&call) {
                Ok(()) => inner.pending.mark_sent(&call_id),
                Err(e) => {
                    tracing::warn!(%call_id, error = %e, "failed to send call");
                    shared.close_locked(&mut inner, "send failed");
                }
            }
        } else {
            inner.outbox.push_back(QueuedCall {
                call_id: call_id.clone(),
                name,
                args,
            });
        }

        PendingReply::waiting(call_id, rx)
    }

    /// Wait until negotiation ends.
    pub async fn ready(&self) -> Result<(), CallError> {
        let mut rx = self.handle.shared.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ChannelState::Ready => return Ok(()),
                ChannelState::Degraded => return Err(CallError::HandshakeTimeout),
                ChannelState::Closed => return Err(CallError::ChannelClosed),
                ChannelState::Connecting | ChannelState::Handshaking => {}
            }
            if rx.changed().await.is_err() {
                return Err(CallError::ChannelClosed);
            }
        }
    }

    pub fn state(&self) -> ChannelState {
        self.handle.shared.inner.lock().state
    }

    /// Observe state transitions, e.g. to show a visible error state.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.handle.shared.state_tx.subscribe()
    }

    /// Method names from the peer's last handshake.
    pub fn peer_methods(&self) -> Vec<String> {
        self.handle.shared.inner.lock().peer_methods.clone()
    }

    pub fn peer_path(&self) -> Option<String> {
        self.handle.shared.inner.lock().peer_path.clone()
    }

    pub fn pending_calls(&self) -> usize {
        self.handle.shared.inner.lock().pending.len()
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.handle.shared.capabilities
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.handle.shared.config
    }

    /// Close the channel, rejecting every pending call with
    /// [`CallError::ChannelClosed`].
    pub fn close(&self) {
        let mut inner = self.handle.shared.inner.lock();
        self.handle.shared.close_locked(&mut inner, "closed locally");
    }
}

async fn drive(shared: Arc<Shared>, mut incoming: Incoming) {
    while let Some(message) = incoming.recv().await {
        shared.on_message(message);
    }
    let mut inner = shared.inner.lock();
    shared.close_locked(&mut inner, "transport ended");
}

impl Shared {
    fn next_call_id(&self) -> String {
        self.next_call_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn set_state(&self, inner: &mut Inner, state: ChannelState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn transmit(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.transport.send(envelope.to_value()?)
    }

    fn spawn_call_timer(self: &Arc<Self>, call_id: String) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.config.call_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_call_timeout(&call_id);
            }
        })
    }

    fn on_message(self: &Arc<Self>, message: Value) {
        let envelope = match Envelope::from_value(message) {
            Ok(envelope) => envelope,
            Err(violation) => {
                tracing::warn!(%violation, "dropping malformed message");
                return;
            }
        };

        let mut inner = self.inner.lock();
        match envelope {
            Envelope::Handshake {
                path,
                supported_methods,
            } => self.on_handshake(&mut inner, path, supported_methods),
            Envelope::MethodCall {
                call_id,
                name,
                args,
            } => {
                let state = inner.state;
                if state == ChannelState::Closed {
                    return;
                }
                if !inner.serving.insert(call_id.clone()) {
                    tracing::warn!(%call_id, method = %name, "dropping repeated call for an id still being served");
                    return;
                }
                let call = QueuedCall {
                    call_id,
                    name,
                    args,
                };
                if state.is_negotiating() {
                    tracing::debug!(call_id = %call.call_id, "buffering call until peer handshake");
                    inner.inbox.push_back(call);
                } else {
                    self.serve(call);
                }
            }
            reply => {
                let state = inner.state;
                if state.is_negotiating() {
                    tracing::debug!(call_id = ?reply.call_id(), "buffering reply until peer handshake");
                    inner.early_replies.push(reply);
                } else {
                    Self::on_reply(&mut inner, reply);
                }
            }
        }
    }

    /// Settle the pending call a return or throw names. Only calls that went
    /// out on the wire can be settled this way.
    fn on_reply(inner: &mut Inner, reply: Envelope) {
        let sent = reply
            .call_id()
            .is_some_and(|call_id| inner.pending.is_sent(call_id));
        if !sent {
            tracing::debug!(
                call_id = ?reply.call_id(),
                kind = reply.type_name(),
                "ignoring reply for unknown, unsent or settled call"
            );
            return;
        }
        match reply {
            Envelope::MethodReturn { call_id, value } => {
                inner.pending.resolve(&call_id, value);
            }
            Envelope::MethodThrow { call_id, error } => {
                inner.pending.reject_remote(&call_id, error);
            }
            Envelope::Handshake { .. } | Envelope::MethodCall { .. } => {}
        }
    }

    fn on_handshake(
        self: &Arc<Self>,
        inner: &mut Inner,
        path: Option<String>,
        methods: Vec<MethodDescriptor>,
    ) {
        let names: Vec<String> = methods.into_iter().map(|m| m.name).collect();
        let state = inner.state;
        match state {
            state if state.is_negotiating() => {
                if let Some(timer) = inner.handshake_timer.take() {
                    timer.abort();
                }
                inner.peer_methods = names;
                inner.peer_path = path;
                self.set_state(inner, ChannelState::Ready);
                tracing::info!(
                    peer_methods = ?inner.peer_methods,
                    peer_path = ?inner.peer_path,
                    buffered = inner.outbox.len(),
                    "peer handshake received; channel ready"
                );
                // Nothing in the outbox has been sent yet, so early replies
                // must be settled before it is flushed.
                self.drain_early_replies(inner);
                self.flush_outbox(inner);
                if inner.state == ChannelState::Ready {
                    self.drain_inbox(inner);
                }
            }
            ChannelState::Ready => {
                tracing::debug!(peer_methods = ?names, "peer re-announced its capabilities");
                inner.peer_methods = names;
                inner.peer_path = path;
            }
            ChannelState::Degraded => {
                tracing::warn!("ignoring peer handshake received after degradation");
            }
            _ => {}
        }
    }

    fn flush_outbox(&self, inner: &mut Inner) {
        while let Some(queued) = inner.outbox.pop_front() {
            if !inner.pending.contains(&queued.call_id) {
                // Timed out while buffered.
                continue;
            }
            if !inner.peer_supports(&queued.name) {
                tracing::debug!(call_id = %queued.call_id, method = %queued.name, "peer does not advertise method");
                inner.pending.reject(
                    &queued.call_id,
                    CallError::UnsupportedMethod { name: queued.name },
                );
                continue;
            }
            let call_id = queued.call_id.clone();
            let call = Envelope::MethodCall {
                call_id: queued.call_id,
                name: queued.name,
                args: queued.args,
            };
            if let Err(e) = self.transmit(&call) {
                tracing::warn!(%call_id, error = %e, "failed to send buffered call");
                self.close_locked(inner, "send failed");
                return;
            }
            inner.pending.mark_sent(&call_id);
        }
    }

    fn drain_early_replies(&self, inner: &mut Inner) {
        let replies = std::mem::take(&mut inner.early_replies);
        for reply in replies {
            Self::on_reply(inner, reply);
        }
    }

    fn drain_inbox(self: &Arc<Self>, inner: &mut Inner) {
        let calls: Vec<QueuedCall> = inner.inbox.drain(..).collect();
        for call in calls {
            self.serve(call);
        }
    }

    /// Run one peer call on its own task and send back its terminal message.
    fn serve(self: &Arc<Self>, call: QueuedCall) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let call_id = call.call_id.clone();
            let reply = shared
                .capabilities
                .dispatch(call.call_id, call.name, call.args)
                .await;
            let mut inner = shared.inner.lock();
            inner.serving.remove(&call_id);
            if inner.state == ChannelState::Closed {
                tracing::debug!(call_id = ?reply.call_id(), "channel closed before reply could be sent");
                return;
            }
            if let Err(e) = shared.transmit(&reply) {
                tracing::warn!(call_id = ?reply.call_id(), error = %e, "failed to send reply");
                shared.close_locked(&mut inner, "send failed");
            }
        });
    }

    fn on_call_timeout(&self, call_id: &str) {
        let mut inner = self.inner.lock();
        let name = inner.pending.name_of(call_id).map(str::to_string);
        if inner.pending.expire(call_id) {
            tracing::debug!(%call_id, method = ?name, "call timed out");
        }
    }

    fn on_handshake_timeout(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if !inner.state.is_negotiating() {
            return;
        }
        inner.handshake_timer = None;
        self.set_state(&mut inner, ChannelState::Degraded);
        tracing::warn!(
            timeout_ms = self.config.handshake_timeout_ms,
            buffered = inner.outbox.len(),
            "peer handshake timed out; channel degraded"
        );
        let queued: Vec<QueuedCall> = inner.outbox.drain(..).collect();
        for call in queued {
            inner.pending.reject(&call.call_id, CallError::HandshakeTimeout);
        }
        self.drain_early_replies(&mut inner);
        self.drain_inbox(&mut inner);
    }

    fn close_locked(&self, inner: &mut Inner, reason: &'static str) {
        if inner.state == ChannelState::Closed {
            return;
        }
        self.set_state(inner, ChannelState::Closed);
        if let Some(timer) = inner.handshake_timer.take() {
            timer.abort();
        }
        if let Some(driver) = inner.driver.take() {
            driver.abort();
        }
        inner.outbox.clear();
        inner.inbox.clear();
        inner.early_replies.clear();
        inner.serving.clear();
        let rejected = inner.pending.reject_all(&CallError::ChannelClosed);
        self.transport.close();
        tracing::info!(reason, rejected, "channel closed");
    }
}
