use std::time::Duration;

use serde_json::{json, Value};
use weft_core::init::{readiness, InitTasks};
use weft_core::ipc::Destinations;
use weft_core::registry::REQUEST_MESSAGE;
use weft_core::{Endpoint, EndpointId, EndpointRole, WeftConfig, WeftError};

#[tokio::test]
async fn endpoints_are_ready_after_init() {
    let config = WeftConfig::default();
    let coordinator = Endpoint::coordinator(&config).await.unwrap();
    assert!(coordinator.ready().is_ready());
    coordinator.ready().wait().await.unwrap();
    assert_eq!(coordinator.id(), EndpointId::COORDINATOR);
    // coordinator serves registry requests, peers do not
    assert_eq!(coordinator.bus.listener_count(REQUEST_MESSAGE), 1);

    let peer = Endpoint::peer(EndpointId(4), &config).await.unwrap();
    assert_eq!(peer.bus.listener_count(REQUEST_MESSAGE), 0);
}

#[tokio::test]
async fn role_and_id_must_agree() {
    let config = WeftConfig::default();
    let err = Endpoint::init(EndpointRole::Peer, EndpointId::COORDINATOR, &config)
        .await
        .err()
        .expect("peer cannot use id 0");
    assert!(matches!(err, WeftError::Ipc(_)));
    assert!(Endpoint::init(EndpointRole::Coordinator, EndpointId(3), &config)
        .await
        .is_err());
}

#[tokio::test]
async fn shutdown_stops_serving_the_registry() {
    let config = WeftConfig::default();
    let coordinator = Endpoint::coordinator(&config).await.unwrap();
    coordinator.shutdown();
    assert_eq!(coordinator.bus.listener_count(REQUEST_MESSAGE), 0);
    assert!(coordinator.bus.endpoints() == vec![EndpointId::COORDINATOR]);
}

#[tokio::test]
async fn linked_peer_appears_in_the_destination_set() {
    let config = WeftConfig::default();
    let coordinator = Endpoint::coordinator(&config).await.unwrap();
    let peer = Endpoint::peer(EndpointId(1), &config).await.unwrap();
    coordinator.link_peer(&peer).unwrap();
    assert_eq!(coordinator.bus.endpoints(), vec![EndpointId(0), EndpointId(1)]);

    peer.bus.on("hello", |event| async move { json!({"got": event.data}) });
    let responses = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.bus.send("hello", json!(1), EndpointId(1)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(responses, vec![json!({"got": 1})]);

    let none = coordinator
        .bus
        .send("hello", Value::Null, Destinations::Only(vec![]))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn ready_waiters_see_failures() {
    let (signal, ready) = readiness();
    let waiter = {
        let ready = ready.clone();
        tokio::spawn(async move { ready.wait().await })
    };
    let mut tasks = InitTasks::new();
    tasks.push("settings", async { Err(WeftError::Config("missing store".into())) });
    assert!(tasks.run(&signal).await.is_err());

    let outcome = waiter.await.unwrap();
    assert!(matches!(outcome, Err(WeftError::Init(reason)) if reason.contains("missing store")));
    assert!(!ready.is_ready());
}
