//! Dedicated pub/sub connection driver.
//!
//! Subscription state lives on the upstream connection, so every SUB and
//! UNSB for one server connection must ride the same upstream as its
//! event reads. The driver owns that connection exclusively: one task,
//! one socket, never pooled, torn down with the connection it serves.

use futures_util::{SinkExt, StreamExt};
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cluster::{resp::RespCodec, Cluster, Command, Value};

use super::{BrokerError, Event, EventStream, PubSubCtl, SubCmd};

/// Open a dedicated pub/sub connection on a random node: a command
/// handle for (un)subscribes and the stream of incoming events, both
/// bound to the same upstream.
pub(crate) async fn open(cluster: Cluster) -> Result<(PubSubCtl, EventStream), BrokerError> {
    let nc = cluster.dial_any().await?;
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let stop = CancellationToken::new();
    tokio::spawn(drive(nc.into_framed(), cmd_rx, event_tx, stop.child_token()));
    Ok((PubSubCtl::new(cmd_tx), EventStream::new(event_rx, stop)))
}

fn sub_command(cmd: &SubCmd) -> Command {
    let name = match (cmd.pattern, cmd.subscribe) {
        (true, true) => "PSUBSCRIBE",
        (true, false) => "PUNSUBSCRIBE",
        (false, true) => "SUBSCRIBE",
        (false, false) => "UNSUBSCRIBE",
    };
    Command::new(name).arg(&cmd.channel)
}

async fn drive(
    framed: tokio_util::codec::Framed<tokio::net::TcpStream, RespCodec>,
    mut cmd_rx: mpsc::Receiver<SubCmd>,
    event_tx: mpsc::Sender<Event>,
    stop: CancellationToken,
) {
    let (mut sink, mut stream) = framed.split();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if let Err(err) = sink.send(sub_command(&cmd)).await {
                    debug!(%err, "subscription command failed");
                    break;
                }
            }
            reply = stream.next() => {
                let value = match reply {
                    None => {
                        debug!("pub/sub upstream closed");
                        break;
                    }
                    Some(Err(err)) => {
                        debug!(%err, "pub/sub read failed");
                        break;
                    }
                    Some(Ok(value)) => value,
                };
                match value.into_result() {
                    Err(err) => {
                        debug!(%err, "pub/sub upstream error");
                        break;
                    }
                    Ok(v) => {
                        if let Some(event) = parse_push(v) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
    // dropping event_tx ends the stream; the owning connection closes
}

fn value_string(value: Value) -> Option<String> {
    value
        .into_bytes()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
}

/// Payloads published through juggler are JSON; anything else a foreign
/// publisher pushed is wrapped as a JSON string.
fn payload_raw(bytes: bytes::Bytes) -> Box<RawValue> {
    let text = String::from_utf8_lossy(&bytes).into_owned();
    serde_json::from_str::<Box<RawValue>>(&text).unwrap_or_else(|_| {
        let quoted = serde_json::to_string(&text).expect("strings serialize");
        RawValue::from_string(quoted).expect("serialized string is valid JSON")
    })
}

/// Decode one push message into an [`Event`]. Subscription confirmations
/// yield nothing.
fn parse_push(value: Value) -> Option<Event> {
    let items = value.into_array()?;
    let mut items = items.into_iter();
    let kind = items.next()?.into_bytes()?;
    match kind.as_ref() {
        b"message" => {
            let channel = value_string(items.next()?)?;
            let args = payload_raw(items.next()?.into_bytes()?);
            Some(Event {
                channel,
                pattern: None,
                args,
            })
        }
        b"pmessage" => {
            let pattern = value_string(items.next()?)?;
            let channel = value_string(items.next()?)?;
            let args = payload_raw(items.next()?.into_bytes()?);
            Some(Event {
                channel,
                pattern: Some(pattern),
                args,
            })
        }
        b"subscribe" | b"unsubscribe" | b"psubscribe" | b"punsubscribe" => {
            trace!(kind = %String::from_utf8_lossy(&kind), "subscription state change");
            None
        }
        other => {
            debug!(kind = %String::from_utf8_lossy(other), "unexpected push message");
            None
        }
    }
}
