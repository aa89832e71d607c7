//! Redirection behavior against scripted upstream nodes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use juggler::cluster::{Cluster, Command, Config, Error, Value};

/// A fake node replying from a script, one reply per received command;
/// replies past the end of the script are `+OK`. Returns the address and
/// a counter of commands served.
async fn fake_node(replies: Vec<String>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let served = Arc::new(AtomicUsize::new(0));
    let served_in_task = served.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let replies = replies.clone();
            let served = served_in_task.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut reply_idx = 0;
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let reply = replies
                        .get(reply_idx)
                        .cloned()
                        .unwrap_or_else(|| "+OK\r\n".to_owned());
                    reply_idx += 1;
                    served.fetch_add(1, Ordering::SeqCst);
                    if sock.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, served)
}

// "foo" hashes to slot 12182
fn set_foo() -> Command {
    Command::new("SET").arg("foo").arg("1")
}

#[tokio::test]
async fn moved_is_surfaced_without_the_retry_wrapper() {
    let (addr_b, _served_b) = fake_node(vec![]).await;
    let (addr_a, _served_a) =
        fake_node(vec![format!("-MOVED 12182 {addr_b}\r\n")]).await;

    let cluster = Cluster::new([addr_a], Config::default());
    let conn = cluster.get();
    let err = conn.command(set_foo()).await.unwrap_err();
    match err {
        Error::Moved { slot, addr } => {
            assert_eq!(slot, 12182);
            assert_eq!(addr, addr_b);
        }
        other => panic!("expected MOVED, got {other}"),
    }
}

#[tokio::test]
async fn retry_follows_moved_and_updates_the_table() {
    let (addr_b, served_b) = fake_node(vec![]).await;
    let (addr_a, served_a) =
        fake_node(vec![format!("-MOVED 12182 {addr_b}\r\n")]).await;

    let cluster = Cluster::new([addr_a], Config::default());
    let retry = cluster.retry();

    let value = retry.command(set_foo()).await.unwrap();
    assert_eq!(value, Value::Simple("OK".into()));
    assert_eq!(served_a.load(Ordering::SeqCst), 1);
    assert_eq!(served_b.load(Ordering::SeqCst), 1);

    // the MOVED updated the shared table: the next command for the same
    // slot goes straight to the new owner
    let value = retry.command(set_foo()).await.unwrap();
    assert_eq!(value, Value::Simple("OK".into()));
    assert_eq!(served_a.load(Ordering::SeqCst), 1);
    assert_eq!(served_b.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ask_redirects_once_without_updating_the_table() {
    let (addr_b, served_b) = fake_node(vec![]).await;
    // every fresh connection to node a answers ASK for this slot
    let (addr_a, served_a) = fake_node(vec![format!("-ASK 12182 {addr_b}\r\n")]).await;

    let cluster = Cluster::new([addr_a], Config::default());
    let retry = cluster.retry();

    let value = retry.command(set_foo()).await.unwrap();
    assert_eq!(value, Value::Simple("OK".into()));
    // the target served ASKING plus the command
    assert_eq!(served_b.load(Ordering::SeqCst), 2);

    // ASK is one-shot: the slot still routes to the original node
    let value = retry.command(set_foo()).await.unwrap();
    assert_eq!(value, Value::Simple("OK".into()));
    assert_eq!(served_a.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn bind_rejects_cross_slot_keys_and_rebinding() {
    let (addr, _) = fake_node(vec![]).await;
    let cluster = Cluster::new([addr], Config::default());

    let conn = cluster.get();
    // "foo" and "bar" land on different slots
    assert!(matches!(
        conn.bind(&["foo", "bar"]).await,
        Err(Error::CrossSlot)
    ));

    conn.bind(&["foo"]).await.unwrap();
    assert!(matches!(conn.bind(&["foo"]).await, Err(Error::AlreadyBound)));
}

#[tokio::test]
async fn pipeline_reads_one_reply_per_command() {
    let (addr, served) = fake_node(vec!["+OK\r\n:1\r\n".to_owned()]).await;
    let cluster = Cluster::new([addr], Config::default());

    let conn = cluster.get();
    let replies = conn
        .pipeline(vec![
            Command::new("SET").arg("k").arg("v"),
            Command::new("LPUSH").arg("k2").arg("v"),
        ])
        .await
        .unwrap();
    assert_eq!(replies, vec![Value::Simple("OK".into()), Value::Int(1)]);
    // both commands arrived in one flush
    assert_eq!(served.load(Ordering::SeqCst), 1);
}
