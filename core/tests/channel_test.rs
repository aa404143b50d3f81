use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use weft_core::channel::{message_types, ExposesChannelMethods, MethodTable};
use weft_core::{Endpoint, EndpointId, RequestPath, WeftConfig, WeftError};

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

async fn cluster(config: &WeftConfig, peers: u32) -> (Endpoint, Vec<Endpoint>) {
    let coordinator = Endpoint::coordinator(config).await.unwrap();
    let mut linked = Vec::new();
    for id in 1..=peers {
        let peer = Endpoint::peer(EndpointId(id), config).await.unwrap();
        coordinator.link_peer(&peer).unwrap();
        linked.push(peer);
    }
    (coordinator, linked)
}

fn editor_path() -> RequestPath {
    RequestPath::parse("app:0->editor:1").unwrap()
}

fn foo_bar() -> MethodTable {
    MethodTable::new()
        .with("foo", |call| async move { Ok(json!(format!("foo:{}", call.arg(0)))) })
        .with("bar", |call| async move {
            let n = call.arg(0).as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        })
}

#[tokio::test]
async fn sender_exposes_exactly_the_receiver_methods() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let _receiver = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();

    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    assert_eq!(sender.methods(), vec!["bar".to_string(), "foo".to_string()]);
    assert!(!sender.is_direct());
    assert_eq!(sender.destination(), Some(EndpointId(1)));

    assert_eq!(sender.invoke("bar", vec![json!(21)]).await.unwrap(), json!(42));
    assert_eq!(sender.invoke("foo", vec![json!("x")]).await.unwrap(), json!("foo:\"x\""));
}

#[tokio::test]
async fn same_endpoint_calls_skip_the_bus() {
    let (_coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let peer = &peers[0];
    let _receiver = peer.channels.receiver(editor_path(), foo_bar()).await.unwrap();

    let sender = within(peer.channels.sender(editor_path(), None, None)).await.unwrap();
    assert!(sender.is_direct());
    assert_eq!(sender.invoke("bar", vec![json!(5)]).await.unwrap(), json!(10));
}

#[tokio::test]
async fn unknown_method_is_rejected_before_sending() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let _receiver = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();
    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();

    assert!(!sender.has_method("baz"));
    let err = sender.invoke("baz", vec![]).await.unwrap_err();
    assert!(matches!(err, WeftError::UnknownMethod { method, .. } if method == "baz"));
}

#[tokio::test]
async fn handler_errors_look_the_same_locally_and_remotely() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let failing = MethodTable::new().with("fail", |_| async {
        Err::<Value, _>(WeftError::Channel("disk full".into()))
    });
    let _receiver = peers[0].channels.receiver(editor_path(), failing).await.unwrap();

    let remote = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    let local = within(peers[0].channels.sender(editor_path(), None, None))
        .await
        .unwrap();

    for sender in [remote, local] {
        let err = sender.invoke("fail", vec![]).await.unwrap_err();
        assert!(matches!(err, WeftError::Remote(ref m) if m.contains("disk full")), "{err}");
    }
}

#[tokio::test]
async fn sub_channel_handshake_waits_for_the_sub_channel() {
    let mut config = WeftConfig::default();
    config.channel.handshake_retry_ms = 20;
    let (coordinator, peers) = cluster(&config, 1).await;
    let receiver = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();

    let hub = Arc::clone(&coordinator.channels);
    let pending = tokio::spawn(async move {
        hub.sender(
            editor_path(),
            Some("toolbar".into()),
            Some(RequestPath::parse("app:0->toolbar:0").unwrap()),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    let toolbar = MethodTable::new()
        .with("foo", |call| async move {
            let sender = call.sender_id.map(|p| p.to_string()).unwrap_or_default();
            Ok(json!(format!("toolbar foo from {sender}")))
        })
        .with("press", |_| async { Ok(json!(true)) });
    receiver.create_sub_channel("toolbar", toolbar).await.unwrap();

    let sender = within(pending).await.unwrap().unwrap();
    assert_eq!(
        sender.methods(),
        vec!["bar".to_string(), "foo".to_string(), "press".to_string()]
    );
    assert_eq!(
        sender.invoke("foo", vec![]).await.unwrap(),
        json!("toolbar foo from app:0->toolbar:0")
    );
    assert_eq!(sender.invoke("bar", vec![json!(1)]).await.unwrap(), json!(2));

    let plain = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    assert!(!plain.has_method("press"));
    assert_eq!(plain.invoke("foo", vec![json!(1)]).await.unwrap(), json!("foo:1"));
}

#[tokio::test]
async fn senders_track_sub_channel_advertisements() {
    let mut config = WeftConfig::default();
    config.channel.handshake_retry_ms = 60_000;
    let (coordinator, peers) = cluster(&config, 1).await;
    let receiver = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();

    let hub = Arc::clone(&coordinator.channels);
    let pending = tokio::spawn(async move { hub.sender(editor_path(), Some("tb".into()), None).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());

    let first = MethodTable::new().with("a", |_| async { Ok(json!(1)) });
    receiver.create_sub_channel("tb", first).await.unwrap();
    let sender = within(pending).await.unwrap().unwrap();
    assert_eq!(sender.methods(), vec!["a".to_string(), "bar".to_string(), "foo".to_string()]);

    let replacement = MethodTable::new().with("b", |_| async { Ok(json!(3)) });
    receiver.create_sub_channel("tb", replacement).await.unwrap();
    let watched = sender.clone();
    eventually(move || watched.has_method("b")).await;
    assert_eq!(sender.methods(), vec!["b".to_string(), "bar".to_string(), "foo".to_string()]);
    assert_eq!(sender.invoke("b", vec![]).await.unwrap(), json!(3));
    assert!(matches!(
        sender.invoke("a", vec![]).await.unwrap_err(),
        WeftError::UnknownMethod { .. }
    ));
}

#[tokio::test]
async fn calls_to_a_disabled_receiver_flush_in_order() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let methods = MethodTable::new().with("push", move |call| {
        let log = Arc::clone(&log);
        async move {
            let n = call.arg(0).as_i64().unwrap_or(-1);
            log.lock().unwrap().push(n);
            Ok(json!(n))
        }
    });
    let receiver = peers[0].channels.receiver(editor_path(), methods).await.unwrap();
    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();

    receiver.set_enabled(false).await.unwrap();
    assert!(!sender.is_enabled());

    let mut calls = Vec::new();
    for n in 1..=3 {
        let caller = sender.clone();
        calls.push(tokio::spawn(async move { caller.invoke("push", vec![json!(n)]).await }));
        let expected = n as usize;
        let buffered = buffered_count(&sender);
        eventually(move || buffered() == expected).await;
    }
    assert!(seen.lock().unwrap().is_empty());

    receiver.set_enabled(true).await.unwrap();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(within(call).await.unwrap().unwrap(), json!(i as i64 + 1));
    }
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(sender.buffered_calls(), 0);
}

fn buffered_count(sender: &weft_core::ChannelSender) -> impl Fn() -> usize {
    let sender = sender.clone();
    move || sender.buffered_calls()
}

#[tokio::test]
async fn full_call_buffer_rejects_new_calls() {
    let mut config = WeftConfig::default();
    config.channel.call_buffer_limit = 1;
    let (coordinator, peers) = cluster(&config, 1).await;
    let receiver = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();
    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    receiver.set_enabled(false).await.unwrap();

    let first = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.invoke("bar", vec![json!(1)]).await })
    };
    let buffered = buffered_count(&sender);
    eventually(move || buffered() == 1).await;

    let err = sender.invoke("bar", vec![json!(2)]).await.unwrap_err();
    assert!(matches!(err, WeftError::Channel(_)));

    receiver.set_enabled(true).await.unwrap();
    assert_eq!(within(first).await.unwrap().unwrap(), json!(2));
}

#[tokio::test]
async fn sender_follows_a_moved_receiver() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 2).await;
    let first = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();
    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    assert_eq!(sender.destination(), Some(EndpointId(1)));

    first.dispose();
    let relocated = MethodTable::new()
        .with("foo", |_| async { Ok(json!("from peer 2")) })
        .with("bar", |_| async { Ok(json!(0)) });
    let second = peers[1].channels.receiver(editor_path(), relocated).await.unwrap();
    second.announce().await.unwrap();

    assert_eq!(sender.destination(), Some(EndpointId(2)));
    assert_eq!(sender.invoke("foo", vec![]).await.unwrap(), json!("from peer 2"));
}

#[tokio::test]
async fn moving_onto_the_sender_endpoint_enables_direct_calls() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let remote = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();
    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    assert!(!sender.is_direct());

    remote.dispose();
    let local = coordinator.channels.receiver(editor_path(), foo_bar()).await.unwrap();
    local.announce().await.unwrap();
    assert!(sender.is_direct());
    assert_eq!(sender.invoke("bar", vec![json!(4)]).await.unwrap(), json!(8));
}

#[tokio::test]
async fn disposed_receiver_stops_answering() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let receiver = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();
    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();

    let key = editor_path().to_string();
    assert_eq!(peers[0].bus.listener_count(&message_types::message(&key)), 1);
    drop(receiver);
    assert_eq!(peers[0].bus.listener_count(&message_types::message(&key)), 0);
    assert_eq!(peers[0].channels.receiver_count(), 0);

    let err = sender.invoke("foo", vec![]).await.unwrap_err();
    assert!(matches!(err, WeftError::Channel(_)));
}

#[tokio::test]
async fn dropping_and_closing_senders_removes_bus_listeners() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let _receiver = peers[0].channels.receiver(editor_path(), foo_bar()).await.unwrap();
    let key = editor_path().to_string();
    let tracked = message_types::message_types(&key);

    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    assert_eq!(coordinator.bus.listener_count(&tracked), 1);
    drop(sender);
    assert_eq!(coordinator.bus.listener_count(&tracked), 0);

    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    sender.close();
    assert_eq!(coordinator.bus.listener_count(&tracked), 0);
    assert!(matches!(sender.invoke("foo", vec![]).await, Err(WeftError::Channel(_))));
}

struct Counter {
    value: AtomicI64,
}

impl ExposesChannelMethods for Counter {
    fn channel_methods(self: Arc<Self>) -> MethodTable {
        let add = Arc::clone(&self);
        let get = self;
        MethodTable::new()
            .with("add", move |call| {
                let counter = Arc::clone(&add);
                async move {
                    let by = call.arg(0).as_i64().unwrap_or(1);
                    Ok(json!(counter.value.fetch_add(by, Ordering::SeqCst) + by))
                }
            })
            .with("get", move |_| {
                let counter = Arc::clone(&get);
                async move { Ok(json!(counter.value.load(Ordering::SeqCst))) }
            })
    }
}

#[tokio::test]
async fn module_method_tables_compose() {
    let (coordinator, peers) = cluster(&WeftConfig::default(), 1).await;
    let counter = Arc::new(Counter {
        value: AtomicI64::new(0),
    });
    let table = counter.channel_methods().merge(foo_bar());
    let _receiver = peers[0].channels.receiver(editor_path(), table).await.unwrap();

    let sender = within(coordinator.channels.sender(editor_path(), None, None))
        .await
        .unwrap();
    assert_eq!(sender.methods().len(), 4);
    sender.invoke("add", vec![json!(3)]).await.unwrap();
    sender.invoke("add", vec![json!(4)]).await.unwrap();
    assert_eq!(sender.invoke("get", vec![]).await.unwrap(), json!(7));
}
