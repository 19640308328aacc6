#![allow(dead_code)]

use std::{collections::HashMap, env, time::Duration};

use frame_bridge::transport::memory::{self, MemorySender};
use frame_bridge::{CapabilityTable, Channel, ChannelConfig, Incoming, Transport};
use serde_json::{json, Value};

/// Env guard that restores previous env vars on drop.
pub struct EnvGuard {
    old: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn set(vars: &[(&str, &str)]) -> Self {
        let mut old = HashMap::new();
        for (k, v) in vars {
            old.insert((*k).to_string(), env::var(k).ok());
            env::set_var(k, v);
        }
        Self { old }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (k, prev) in self.old.drain() {
            match prev {
                Some(v) => env::set_var(k, v),
                None => env::remove_var(k),
            }
        }
    }
}

/// The far end of a memory transport, driven by hand.
pub struct FakePeer {
    pub sender: MemorySender,
    pub incoming: Incoming,
}

impl FakePeer {
    pub fn send(&self, message: Value) {
        self.sender.send(message).expect("peer send");
    }

    pub async fn recv(&mut self) -> Value {
        self.incoming.recv().await.expect("channel closed its transport")
    }

    /// Whatever the channel has sent so far and not yet read.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(v) = self.incoming.try_recv() {
            out.push(v);
        }
        out
    }

    /// Consume the channel's handshake and answer with `methods`.
    pub async fn handshake(&mut self, methods: &[&str]) -> Value {
        let theirs = self.recv().await;
        assert_eq!(theirs["type"], "handshake");
        self.send(handshake(methods));
        theirs
    }

    pub fn reply(&self, call_id: &str, value: Value) {
        self.send(json!({ "type": "methodreturn", "callId": call_id, "value": value }));
    }

    pub fn throw(&self, call_id: &str, message: &str) {
        self.send(json!({ "type": "methodthrow", "callId": call_id, "error": { "message": message } }));
    }
}

pub fn handshake(methods: &[&str]) -> Value {
    let supported: Vec<Value> = methods
        .iter()
        .map(|m| json!({ "name": m, "returns": "Promise" }))
        .collect();
    json!({ "type": "handshake", "supportedMethods": supported })
}

pub fn config() -> ChannelConfig {
    ChannelConfig::default()
        .with_handshake_timeout(Duration::from_secs(5))
        .with_call_timeout(Duration::from_secs(10))
}

pub fn open_with_peer(capabilities: CapabilityTable, config: ChannelConfig) -> (Channel, FakePeer) {
    let (ours, theirs) = memory::pair();
    let (tx, rx) = ours.into_parts();
    let channel = Channel::open(tx, rx, capabilities, config).expect("valid config");
    let (sender, incoming) = theirs.into_parts();
    (channel, FakePeer { sender, incoming })
}

/// Let spawned tasks (driver, invocations) run to quiescence. Under a paused
/// clock the sleep only completes once every other task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
