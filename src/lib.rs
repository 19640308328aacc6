//! # frame_bridge
//!
//! Method calls between a **host application** and an **embedded tool** that
//! runs somewhere the host cannot hold direct references into: a sandboxed
//! frame, a child process, another thread behind a message queue.
//!
//! - Both sides announce what they expose with a **handshake**
//! - Calls travel as JSON **envelopes** correlated by an opaque `callId`
//! - Every call ends in exactly one **return** or **throw**, or times out
//!
//! ---
//!
//! ## The wire protocol
//!
//! Four tagged JSON shapes (see [`envelope`]):
//!
//! ```text
//! { type: "handshake",    path?: string, supportedMethods: [{ name, returns: "Promise" }] }
//! { type: "methodcall",   callId: string, name: string, args: any[] }
//! { type: "methodreturn", callId: string, value: any }
//! { type: "methodthrow",  callId: string, error: { message, stack? } }
//! ```
//!
//! ### Most important gotchas (read this first)
//!
//! - **Handshake first:** calls issued before the peer's handshake are
//!   buffered and flushed in order once it arrives. If it never arrives within
//!   [`ChannelConfig::handshake_timeout_ms`], the channel is
//!   [`ChannelState::Degraded`] and every call fails with
//!   [`CallError::HandshakeTimeout`].
//! - **Responses arrive out of order:** correlation is by `callId` only.
//! - **Unadvertised methods never hit the wire:** they fail immediately with
//!   [`CallError::UnsupportedMethod`].
//! - **Closing is a bulk failure:** every pending call rejects with
//!   [`CallError::ChannelClosed`]. Dropping the last [`Channel`] clone closes
//!   it too.
//! - **Nothing is acted on before the peer's handshake:** early calls wait,
//!   and early returns or throws can only name calls that never went out, so
//!   they settle nothing.
//! - **Malformed input is dropped, not fatal:** it is logged through `tracing`
//!   as a protocol violation and the channel keeps going.
//!
//! ---
//!
//! ## Crate layout
//!
//! - [`envelope`] — wire shapes and validation.
//! - [`capability`] — declared interfaces and the handler table served to the peer.
//! - [`dispatcher`] — the pending-call table and [`PendingReply`].
//! - [`channel`] — handshake negotiation and the channel state machine.
//! - [`transport`] — the send/receive seam, an in-memory pair, and stream framing.
//! - [`config`] — [`ChannelConfig`] from code, TOML, or the environment.
//!
//! ---
//!
//! ## Quick start: tool and host in one process
//!
//! ```no_run
//! use frame_bridge::capability::{arg, CapabilityInterface, CapabilityTable};
//! use frame_bridge::transport::memory;
//! use frame_bridge::{Channel, ChannelConfig};
//! use serde_json::{json, Value};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (host_end, tool_end) = memory::pair();
//!
//! // The tool exposes the standard embedded-tool interface.
//! let mut tool = CapabilityTable::builder(CapabilityInterface::embedded_tool());
//! tool.register_sync("hasUnsavedChanges", |_| Ok(json!(false)))?
//!     .register_sync("navigate", |args| {
//!         let path: String = arg(&args, 0)?;
//!         Ok(json!({ "at": path }))
//!     })?
//!     .register_async("saveState", |_| async { Ok(json!({ "page": 3 })) })?
//!     .register_sync("restoreState", |_| Ok(Value::Null))?;
//!
//! let (tx, rx) = tool_end.into_parts();
//! let _tool = Channel::open(tx, rx, tool.build()?, ChannelConfig::default())?;
//!
//! let (tx, rx) = host_end.into_parts();
//! let host = Channel::open(tx, rx, CapabilityTable::empty(), ChannelConfig::default())?;
//!
//! host.ready().await?;
//! let state = host.invoke("saveState", vec![]).await?;
//! assert_eq!(state, json!({ "page": 3 }));
//! # Ok(())
//! # }
//! ```
//!
//! ---
//!
//! ## A tool in a child process
//!
//! With the `stream` feature (default), [`transport::stream::stdio`] frames
//! envelopes over stdin/stdout as a 4-byte native-endian length followed by
//! UTF-8 JSON. **Do not print to stdout** in such a tool; it corrupts the
//! stream. Point your `tracing` subscriber at stderr.
//!
//! ```no_run
//! use frame_bridge::transport::stream;
//! use frame_bridge::{CapabilityTable, Channel, ChannelConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChannelConfig::default().with_env_overrides()?;
//! let (tx, rx) = stream::stdio(config.max_frame_len);
//! let channel = Channel::open(tx, rx, CapabilityTable::empty(), config)?;
//! channel.ready().await?;
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod transport;

#[doc(inline)]
pub use capability::{CapabilityError, CapabilityInterface, CapabilityTable};
#[doc(inline)]
pub use channel::{Channel, ChannelState};
#[doc(inline)]
pub use config::ChannelConfig;
#[doc(inline)]
pub use dispatcher::PendingReply;
#[doc(inline)]
pub use envelope::{Envelope, ErrorPayload, MethodDescriptor, ProtocolViolation};
#[doc(inline)]
pub use error::{CallError, ConfigError, RegistrationError, TransportError};
#[doc(inline)]
pub use transport::{Incoming, Transport};
