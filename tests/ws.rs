//! End-to-end scenarios over real WebSockets, with the in-memory broker
//! standing in for the clustered upstream.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use async_trait::async_trait;
use common::ws_client::RawClient;
use common::{collector, next_msg, start_server, MemBroker, TestThunk};
use juggler::msg::Payload;
use juggler::{code, Callee, Client, Conn, ConnState, Kind, Msg, Server, WriteHandler};

fn test_server(broker: &MemBroker) -> Server {
    Server::new(Arc::new(broker.clone()), Arc::new(broker.clone()))
        .with_acquire_write_lock_timeout(Duration::from_secs(1))
}

async fn next_state(rx: &mut mpsc::UnboundedReceiver<ConnState>) -> ConnState {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a state change")
        .expect("state channel closed")
}

#[tokio::test]
async fn connection_lifecycle() {
    let broker = MemBroker::new();
    let (state_tx, mut states) = mpsc::unbounded_channel();
    let server = test_server(&broker).with_conn_state(Arc::new(move |_conn, state| {
        let _ = state_tx.send(state);
    }));
    let (url, _shutdown) = start_server(server).await;

    let (handler, _msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();

    assert_eq!(next_state(&mut states).await, ConnState::Accepting);
    assert_eq!(next_state(&mut states).await, ConnState::Connected);

    // closing the client closes the served connection
    client.close();
    client.closed().await;

    assert_eq!(next_state(&mut states).await, ConnState::Closing);
    assert_eq!(next_state(&mut states).await, ConnState::Closed);
}

#[tokio::test]
async fn happy_call() {
    let broker = MemBroker::new();
    let _callee = Callee::new(Arc::new(broker.clone()))
        .with_workers(2)
        .serve(&["add".into()], Arc::new(TestThunk))
        .await
        .unwrap();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let (handler, mut msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();
    let call_uuid = client
        .call("add", &[1, 2], Duration::from_millis(1000))
        .await
        .unwrap();

    let ok = next_msg(&mut msgs).await;
    assert_eq!(ok.meta.kind, Kind::Ok);
    assert_eq!(ok.for_uuid(), Some(call_uuid));

    let res = next_msg(&mut msgs).await;
    assert_eq!(res.meta.kind, Kind::Res);
    let Payload::Res(p) = res.payload else {
        panic!("expected RES payload");
    };
    assert_eq!(p.for_uuid, call_uuid);
    assert_eq!(p.uri, "add");
    assert_eq!(p.args.get(), "3");

    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn expired_call_resolves_locally() {
    let broker = MemBroker::new();
    // no callee listens on the uri
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let (handler, mut msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();

    let started = Instant::now();
    let call_uuid = client
        .call("add", &[1, 2], Duration::from_millis(50))
        .await
        .unwrap();

    let ok = next_msg(&mut msgs).await;
    assert_eq!(ok.meta.kind, Kind::Ok);

    let exp = next_msg(&mut msgs).await;
    assert_eq!(exp.meta.kind, Kind::Exp);
    assert_eq!(exp.for_uuid(), Some(call_uuid));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "EXP before the deadline");
    assert!(elapsed < Duration::from_secs(1), "EXP took {elapsed:?}");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn handler_error_comes_back_as_error_result() {
    let broker = MemBroker::new();
    let _callee = Callee::new(Arc::new(broker.clone()))
        .serve(&["boom".into()], Arc::new(TestThunk))
        .await
        .unwrap();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let (handler, mut msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();
    let call_uuid = client
        .call("boom", &(), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(next_msg(&mut msgs).await.meta.kind, Kind::Ok);
    let res = next_msg(&mut msgs).await;
    let Payload::Res(p) = res.payload else {
        panic!("expected RES payload");
    };
    assert_eq!(p.for_uuid, call_uuid);
    let v: serde_json::Value = serde_json::from_str(p.args.get()).unwrap();
    assert_eq!(v["error"]["message"], "kaboom");
}

#[tokio::test]
async fn allow_list_violation_closes_after_err() {
    let broker = MemBroker::new();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let mut raw = RawClient::connect(&url, Some("call, pub")).await;
    let sub = Msg::new_sub("c", false);
    raw.send(&sub).await;

    let err = raw.recv().await.expect("expected a terminal ERR");
    assert_eq!(err.meta.kind, Kind::Err);
    let Payload::Err(p) = err.payload else {
        panic!("expected ERR payload");
    };
    assert_eq!(p.for_uuid, sub.meta.uuid);
    assert_eq!(p.code, code::DISALLOWED_KIND);

    // nothing after the ERR: the connection is closed
    assert!(raw.recv().await.is_none());
}

#[tokio::test]
async fn allowed_kinds_still_work_under_allow_list() {
    let broker = MemBroker::new();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let mut raw = RawClient::connect(&url, Some("call, pub")).await;
    let publ = Msg::new_pub(
        "c",
        serde_json::value::to_raw_value(&"p1").unwrap(),
    );
    raw.send(&publ).await;
    let ok = raw.recv().await.expect("expected OK");
    assert_eq!(ok.meta.kind, Kind::Ok);
    assert_eq!(ok.for_uuid(), Some(publ.meta.uuid));
}

#[tokio::test]
async fn oversize_write_substitutes_err() {
    let broker = MemBroker::new();
    let _callee = Callee::new(Arc::new(broker.clone()))
        .with_workers(2)
        .serve(&["add".into(), "big".into()], Arc::new(TestThunk))
        .await
        .unwrap();
    let server = test_server(&broker).with_write_limit(1024);
    let (url, _shutdown) = start_server(server).await;

    let (handler, mut msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();

    let big_uuid = client.call("big", &(), Duration::from_secs(1)).await.unwrap();
    assert_eq!(next_msg(&mut msgs).await.meta.kind, Kind::Ok);

    let err = next_msg(&mut msgs).await;
    assert_eq!(err.meta.kind, Kind::Err);
    let Payload::Err(p) = err.payload else {
        panic!("expected ERR payload");
    };
    assert_eq!(p.for_uuid, big_uuid, "substituted ERR names the call");
    assert_eq!(p.code, code::TOO_LARGE);

    // the connection survived the substitution
    let add_uuid = client
        .call("add", &[20, 22], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(next_msg(&mut msgs).await.meta.kind, Kind::Ok);
    let res = next_msg(&mut msgs).await;
    let Payload::Res(p) = res.payload else {
        panic!("expected RES payload");
    };
    assert_eq!(p.for_uuid, add_uuid);
    assert_eq!(p.args.get(), "42");
}

#[tokio::test]
async fn oversize_err_is_substituted_as_well() {
    let broker = MemBroker::new();
    let server = test_server(&broker).with_write_limit(1024);
    let (url, _shutdown) = start_server(server).await;

    let (handler, mut msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();

    let channel = "c".repeat(4 * 1024);
    client.subscribe(&channel, false).await.unwrap();
    assert_eq!(next_msg(&mut msgs).await.meta.kind, Kind::Ok);

    // the rejection text embeds the channel name and would bust the
    // write limit, so the ERR itself is substituted
    let again = client.subscribe(&channel, false).await.unwrap();
    let err = next_msg(&mut msgs).await;
    assert_eq!(err.meta.kind, Kind::Err);
    let Payload::Err(p) = err.payload else {
        panic!("expected ERR payload");
    };
    assert_eq!(p.for_uuid, again);
    assert_eq!(p.code, code::TOO_LARGE);
}

struct DropSecretEvents;

#[async_trait]
impl WriteHandler for DropSecretEvents {
    async fn handle(&self, _conn: &Conn, msg: Msg) -> Option<Msg> {
        if let Payload::Evnt(p) = &msg.payload {
            if p.channel == "secret" {
                return None;
            }
        }
        Some(msg)
    }
}

#[tokio::test]
async fn write_handler_gates_outgoing_messages() {
    let broker = MemBroker::new();
    let server = test_server(&broker).with_write_handler(Arc::new(DropSecretEvents));
    let (url, _shutdown) = start_server(server).await;

    let (handler, mut msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();

    client.subscribe("secret", false).await.unwrap();
    client.subscribe("c", false).await.unwrap();
    assert_eq!(next_msg(&mut msgs).await.meta.kind, Kind::Ok);
    assert_eq!(next_msg(&mut msgs).await.meta.kind, Kind::Ok);
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.publish("secret", &1).await.unwrap();
    client.publish("c", &2).await.unwrap();

    // events ride the write path in publish order, so the first EVNT
    // through proves the suppressed one never reached the socket
    let evnt = loop {
        let msg = next_msg(&mut msgs).await;
        if msg.meta.kind == Kind::Evnt {
            break msg;
        }
        assert_eq!(msg.meta.kind, Kind::Ok);
    };
    let Payload::Evnt(p) = evnt.payload else {
        panic!("expected EVNT payload");
    };
    assert_eq!(p.channel, "c");
    assert_eq!(p.args.get(), "2");
}

#[tokio::test]
async fn pubsub_round_trip() {
    let broker = MemBroker::new();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let (handler_a, mut msgs_a) = collector();
    let a = Client::dial(&url, handler_a).await.unwrap();
    let (handler_b, mut msgs_b) = collector();
    let b = Client::dial(&url, handler_b).await.unwrap();

    a.subscribe("c", false).await.unwrap();
    assert_eq!(next_msg(&mut msgs_a).await.meta.kind, Kind::Ok);
    // let the subscription settle on the broker side
    tokio::time::sleep(Duration::from_millis(100)).await;

    b.publish("c", &"hello").await.unwrap();
    assert_eq!(next_msg(&mut msgs_b).await.meta.kind, Kind::Ok);

    let evnt = next_msg(&mut msgs_a).await;
    assert_eq!(evnt.meta.kind, Kind::Evnt);
    let Payload::Evnt(p) = evnt.payload else {
        panic!("expected EVNT payload");
    };
    assert_eq!(p.channel, "c");
    assert_eq!(p.pattern, None);
    assert_eq!(p.args.get(), r#""hello""#);
}

#[tokio::test]
async fn pattern_subscription_carries_the_glob() {
    let broker = MemBroker::new();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let (handler_a, mut msgs_a) = collector();
    let a = Client::dial(&url, handler_a).await.unwrap();
    let (handler_b, mut msgs_b) = collector();
    let b = Client::dial(&url, handler_b).await.unwrap();

    a.subscribe("news.*", true).await.unwrap();
    assert_eq!(next_msg(&mut msgs_a).await.meta.kind, Kind::Ok);
    tokio::time::sleep(Duration::from_millis(100)).await;

    b.publish("news.tech", &42).await.unwrap();
    assert_eq!(next_msg(&mut msgs_b).await.meta.kind, Kind::Ok);

    let evnt = next_msg(&mut msgs_a).await;
    let Payload::Evnt(p) = evnt.payload else {
        panic!("expected EVNT payload");
    };
    assert_eq!(p.channel, "news.tech");
    assert_eq!(p.pattern.as_deref(), Some("news.*"));
    assert_eq!(p.args.get(), "42");
}

#[tokio::test]
async fn redundant_subscribe_is_rejected() {
    let broker = MemBroker::new();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let (handler, mut msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();

    client.subscribe("c", false).await.unwrap();
    assert_eq!(next_msg(&mut msgs).await.meta.kind, Kind::Ok);

    let again = client.subscribe("c", false).await.unwrap();
    let err = next_msg(&mut msgs).await;
    assert_eq!(err.meta.kind, Kind::Err);
    let Payload::Err(p) = err.payload else {
        panic!("expected ERR payload");
    };
    assert_eq!(p.for_uuid, again);
    assert_eq!(p.code, code::REDUNDANT_SUB);

    // unsubscribing something never subscribed is rejected too
    let unsb = client.unsubscribe("other", false).await.unwrap();
    let err = next_msg(&mut msgs).await;
    let Payload::Err(p) = err.payload else {
        panic!("expected ERR payload");
    };
    assert_eq!(p.for_uuid, unsb);
    assert_eq!(p.code, code::UNKNOWN_SUB);
}

#[tokio::test]
async fn acks_follow_arrival_order() {
    let broker = MemBroker::new();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let (handler, mut msgs) = collector();
    let client = Client::dial(&url, handler).await.unwrap();

    let mut sent = Vec::new();
    for i in 0..5 {
        sent.push(client.publish("c", &i).await.unwrap());
    }
    for expected in sent {
        let ok = next_msg(&mut msgs).await;
        assert_eq!(ok.meta.kind, Kind::Ok);
        assert_eq!(ok.for_uuid(), Some(expected));
    }
}

#[tokio::test]
async fn decode_error_keeps_the_connection_open() {
    let broker = MemBroker::new();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let mut raw = RawClient::connect(&url, None).await;
    raw.send_text("this is not a juggler message".into()).await;

    let err = raw.recv().await.expect("expected an ERR");
    assert_eq!(err.meta.kind, Kind::Err);
    let Payload::Err(p) = err.payload else {
        panic!("expected ERR payload");
    };
    assert_eq!(p.code, code::MALFORMED);

    // still serving
    let publ = Msg::new_pub("c", serde_json::value::to_raw_value(&1).unwrap());
    raw.send(&publ).await;
    let ok = raw.recv().await.expect("expected OK");
    assert_eq!(ok.for_uuid(), Some(publ.meta.uuid));
}

#[tokio::test]
async fn read_limit_overflow_closes() {
    let broker = MemBroker::new();
    let server = test_server(&broker).with_read_limit(256);
    let (url, _shutdown) = start_server(server).await;

    let mut raw = RawClient::connect(&url, None).await;
    let publ = Msg::new_pub(
        "c",
        serde_json::value::to_raw_value(&"y".repeat(1024)).unwrap(),
    );
    raw.send(&publ).await;
    assert!(raw.recv().await.is_none(), "oversize read should close");
}

#[tokio::test]
async fn subprotocol_is_required() {
    let broker = MemBroker::new();
    let (url, _shutdown) = start_server(test_server(&broker)).await;

    let mut raw = RawClient::connect_bare(&url).await;
    // the upgrade completes, but the server closes without any framing
    assert!(raw.recv().await.is_none());
}

#[tokio::test]
async fn concurrent_closes_produce_one_transition() {
    let broker = MemBroker::new();
    let (state_tx, mut states) = mpsc::unbounded_channel();
    let served: Arc<Mutex<Option<Conn>>> = Arc::new(Mutex::new(None));
    let served_in_cb = served.clone();
    let server = test_server(&broker).with_conn_state(Arc::new(move |conn, state| {
        let _ = state_tx.send(state);
        if state == ConnState::Connected {
            *served_in_cb.lock().unwrap() = Some(conn.clone());
        }
    }));
    let (url, _shutdown) = start_server(server).await;

    let (handler, _msgs) = collector();
    let _client = Client::dial(&url, handler).await.unwrap();

    assert_eq!(next_state(&mut states).await, ConnState::Accepting);
    assert_eq!(next_state(&mut states).await, ConnState::Connected);
    let conn = served.lock().unwrap().take().expect("served connection");

    let (c1, c2) = (conn.clone(), conn.clone());
    let t1 = tokio::spawn(async move { c1.close() });
    let t2 = tokio::spawn(async move { c2.close() });
    let _ = tokio::join!(t1, t2);
    conn.closed().await;

    assert_eq!(next_state(&mut states).await, ConnState::Closing);
    assert_eq!(next_state(&mut states).await, ConnState::Closed);
    // no duplicate transitions queued behind Closed
    assert!(states.try_recv().is_err());
}
