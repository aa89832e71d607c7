//! juggler: a WebSocket call/pub-sub server multiplexed over a clustered
//! key/value broker.
//!
//! A juggler [`Server`] speaks a small envelope protocol over a
//! subprotocol-negotiated WebSocket. Clients issue request/response calls
//! (CALL → OK, then RES or EXP) that are routed through the broker to
//! external worker processes ([`Callee`]s), and publish/subscribe on
//! named channels and channel globs (PUB/SUB/UNSB → OK, events arriving
//! as EVNT). The broker is a clustered key/value upstream reached through
//! the slot-aware [`cluster`] multiplexer.
//!
//! ## Serving
//!
//! ```no_run
//! use juggler::{broker::RedisBroker, cluster::{Cluster, Config}, Server};
//! use std::sync::Arc;
//!
//! # async fn _main() {
//! let cluster = Cluster::new(["127.0.0.1:7000"], Config::default());
//! let broker = Arc::new(RedisBroker::new(cluster));
//!
//! let server = Arc::new(Server::new(broker.clone(), broker));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:9000").await.unwrap();
//! // The shutdown handle stops the server when dropped.
//! let shutdown = server.serve(listener).await;
//! # let _ = shutdown;
//! # }
//! ```
//!
//! ## Serving calls
//!
//! A callee pulls calls for the URIs it serves and stores results back
//! through the broker:
//!
//! ```no_run
//! use juggler::{broker::{CallPayload, RedisBroker}, Callee, CallHandler};
//! use async_trait::async_trait;
//! use serde_json::value::RawValue;
//! use std::sync::Arc;
//!
//! struct Add;
//!
//! #[async_trait]
//! impl CallHandler for Add {
//!     async fn call(&self, cp: &CallPayload) -> Result<Box<RawValue>, String> {
//!         let (a, b): (i64, i64) =
//!             serde_json::from_str(cp.args.get()).map_err(|e| e.to_string())?;
//!         serde_json::value::to_raw_value(&(a + b)).map_err(|e| e.to_string())
//!     }
//! }
//!
//! # async fn _main(broker: Arc<RedisBroker>) {
//! let callee = Callee::new(broker).with_workers(4);
//! let running = callee.serve(&["add".into()], Arc::new(Add)).await.unwrap();
//! # let _ = running;
//! # }
//! ```
//!
//! ## Calling
//!
//! The [`Client`] keeps a pending table of outstanding calls; every call
//! resolves exactly once, as RES, EXP from the server, or a locally
//! synthesized EXP when the deadline lapses with no answer.
//!
//! ## Concurrency model
//!
//! Each served connection runs four flows: a read flow, a write flow
//! owning the socket's sink behind a bounded hand-off, a result-delivery
//! flow reading this connection's result list, and an event flow owning
//! the connection's dedicated pub/sub upstream. See [`ConnState`] for the
//! lifecycle these flows share.

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[cfg(feature = "axum")]
mod axum;
#[cfg(feature = "axum")]
pub use crate::axum::{juggler_websocket, AxumWsCfg};

pub mod broker;

mod callee;
pub use callee::{CallHandler, Callee, CalleeShutdown};

mod client;
pub use client::{Client, ClientHandler};

pub mod cluster;

mod conn;
pub use conn::{process_msg, Conn, ConnState, ConnStateFn};

mod error;
pub use error::{code, Error};

pub mod msg;
pub use msg::{Kind, Msg};

mod server;
pub use server::{
    FrameSink, FrameStream, Handler, Server, ServerShutdown, WriteHandler, WsFrames,
    ALLOWED_MESSAGES_HEADER, DEFAULT_WRITE_BUFFER, SUBPROTOCOLS,
};

mod tasks;
pub(crate) use tasks::TaskSet;
