mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::config;
use frame_bridge::capability::{arg, CapabilityError, CapabilityInterface};
use frame_bridge::transport::memory;
use frame_bridge::{CallError, CapabilityTable, Channel, ChannelState};
use serde_json::{json, Value};
use tokio::time::Instant;

struct Pair {
    host: Channel,
    tool: Channel,
    host_calls: Arc<AtomicUsize>,
}

/// Host exposes `navigate` and `saveState`; the tool exposes the standard
/// embedded-tool interface.
fn connect() -> Pair {
    let host_calls = Arc::new(AtomicUsize::new(0));

    let mut host = CapabilityTable::builder(CapabilityInterface::new(
        "host",
        ["navigate", "saveState"],
    ));
    let counter = Arc::clone(&host_calls);
    host.register_sync("navigate", move |args| {
        counter.fetch_add(1, Ordering::SeqCst);
        let path: String = arg(&args, 0)?;
        match path.as_str() {
            "/x" => Err(CapabilityError::new("bad path")),
            "/panic" => panic!("bad path"),
            _ => Ok(json!({ "navigated": path })),
        }
    })
    .unwrap();
    let counter = Arc::clone(&host_calls);
    host.register_async("saveState", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "page": 3 }))
        }
    })
    .unwrap();

    let mut tool = CapabilityTable::builder(CapabilityInterface::embedded_tool());
    tool.register_sync("hasUnsavedChanges", |_| Ok(json!(true)))
        .unwrap()
        .register_sync("navigate", |_| Ok(Value::Null))
        .unwrap()
        .register_async("saveState", |_| async { Ok(json!({ "draft": "x" })) })
        .unwrap()
        .register_sync("restoreState", |args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
        .unwrap();

    let (host_end, tool_end) = memory::pair();
    let (tx, rx) = host_end.into_parts();
    let host = Channel::open(tx, rx, host.build().unwrap(), config()).unwrap();
    let (tx, rx) = tool_end.into_parts();
    let tool = Channel::open(tx, rx, tool.build().unwrap(), config()).unwrap();

    Pair {
        host,
        tool,
        host_calls,
    }
}

#[tokio::test(start_paused = true)]
async fn both_sides_learn_each_others_methods() {
    let pair = connect();
    pair.host.ready().await.unwrap();
    pair.tool.ready().await.unwrap();
    assert_eq!(pair.tool.peer_methods(), vec!["navigate", "saveState"]);
    assert_eq!(
        pair.host.peer_methods(),
        vec!["hasUnsavedChanges", "navigate", "saveState", "restoreState"]
    );
}

#[tokio::test(start_paused = true)]
async fn unadvertised_host_method_is_rejected_locally() {
    let pair = connect();
    pair.tool.ready().await.unwrap();

    let outcome = pair
        .tool
        .invoke("restoreState", vec![json!({ "x": 1 })])
        .await;
    assert_eq!(
        outcome,
        Err(CallError::UnsupportedMethod {
            name: "restoreState".into()
        })
    );
    assert_eq!(pair.host_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn async_capability_result_reaches_the_caller() {
    let pair = connect();
    pair.tool.ready().await.unwrap();

    let start = Instant::now();
    let state = pair.tool.invoke("saveState", vec![]).await.unwrap();
    assert_eq!(state, json!({ "page": 3 }));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(pair.tool.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn synchronous_failure_rejects_with_its_message() {
    let pair = connect();
    pair.tool.ready().await.unwrap();

    let outcome = pair.tool.invoke("navigate", vec![json!("/x")]).await;
    assert_eq!(
        outcome,
        Err(CallError::Remote {
            message: "bad path".into(),
            stack: None
        })
    );
}

#[tokio::test(start_paused = true)]
async fn panicking_capability_does_not_break_the_channel() {
    let pair = connect();
    pair.tool.ready().await.unwrap();

    let outcome = pair.tool.invoke("navigate", vec![json!("/panic")]).await;
    assert!(matches!(outcome, Err(CallError::Remote { ref message, .. }) if message == "bad path"));

    assert_eq!(pair.host.state(), ChannelState::Ready);
    let ok = pair.tool.invoke("navigate", vec![json!("/home")]).await;
    assert_eq!(ok.unwrap(), json!({ "navigated": "/home" }));
}

#[tokio::test(start_paused = true)]
async fn calls_flow_in_both_directions_at_once() {
    let pair = connect();
    pair.host.ready().await.unwrap();

    let from_tool = pair.tool.invoke("saveState", vec![]);
    let dirty = pair.host.invoke("hasUnsavedChanges", vec![]);
    let restored = pair
        .host
        .invoke("restoreState", vec![json!({ "page": 3 })]);

    assert_eq!(dirty.await.unwrap(), json!(true));
    assert_eq!(restored.await.unwrap(), json!({ "page": 3 }));
    assert_eq!(from_tool.await.unwrap(), json!({ "page": 3 }));
}

#[tokio::test(start_paused = true)]
async fn closing_one_side_closes_the_other() {
    let pair = connect();
    pair.tool.ready().await.unwrap();

    let pending = pair.tool.invoke("saveState", vec![]);
    pair.host.close();

    assert_eq!(pending.await, Err(CallError::ChannelClosed));
    let mut states = pair.tool.state_changes();
    while *states.borrow_and_update() != ChannelState::Closed {
        states.changed().await.unwrap();
    }
}
