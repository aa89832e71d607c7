//! The callee runtime: pull calls, invoke a handler, store results.
//!
//! A [`Callee`] opens one merged call stream for the URIs it serves and
//! fans the work into a pool of invocation workers. Each invocation runs
//! under the deadline budget the broker stamped at dequeue: a handler
//! error is stored as an error result, a handler timeout stores nothing
//! at all, which the caller observes as EXP.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::value::RawValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{BrokerError, CallPayload, CalleeBroker, CallsConn};
use crate::TaskSet;

/// Invoked once per dequeued call. The `Err` string is shipped back to
/// the caller inside an `{"error": ...}` result.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Produce the call's result.
    async fn call(&self, cp: &CallPayload) -> Result<Box<RawValue>, String>;
}

/// A worker pool serving calls for a set of URIs.
#[derive(Clone)]
pub struct Callee {
    broker: Arc<dyn CalleeBroker>,
    workers: usize,
}

impl std::fmt::Debug for Callee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callee")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

/// Handle to a running callee. Dropping it stops the workers and the
/// underlying dequeue streams.
#[derive(Debug)]
pub struct CalleeShutdown {
    tasks: TaskSet,
}

impl CalleeShutdown {
    /// Stop the workers and wait for in-flight invocations to finish
    /// being abandoned.
    pub async fn shutdown(self) {
        self.tasks.shutdown().await;
    }
}

impl Drop for CalleeShutdown {
    fn drop(&mut self) {
        self.tasks.cancel();
    }
}

impl Callee {
    /// A callee over `broker` with a single worker.
    pub fn new(broker: Arc<dyn CalleeBroker>) -> Self {
        Self { broker, workers: 1 }
    }

    /// Size of the invocation worker pool.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Start serving calls for `uris` with `handler`.
    pub async fn serve(
        &self,
        uris: &[String],
        handler: Arc<dyn CallHandler>,
    ) -> Result<CalleeShutdown, BrokerError> {
        let calls = Arc::new(Mutex::new(self.broker.calls(uris).await?));
        let tasks = TaskSet::new();
        for _ in 0..self.workers {
            tasks.spawn_cancellable(worker(
                calls.clone(),
                self.broker.clone(),
                handler.clone(),
            ));
        }
        Ok(CalleeShutdown { tasks })
    }
}

/// One invocation worker: waits its turn on the shared stream, then
/// processes its call while the next worker takes over the stream.
async fn worker(
    calls: Arc<Mutex<CallsConn>>,
    broker: Arc<dyn CalleeBroker>,
    handler: Arc<dyn CallHandler>,
) {
    loop {
        let next = { calls.lock().await.next().await };
        let Some(cp) = next else { break };
        invoke(&*broker, &*handler, cp).await;
    }
}

/// Invoke the handler under the call's remaining budget and store what
/// it produced.
async fn invoke(broker: &dyn CalleeBroker, handler: &dyn CallHandler, cp: CallPayload) {
    let Some(budget) = cp.remaining_budget() else {
        debug!(msg = %cp.msg_uuid, uri = %cp.uri, "budget spent before invocation, dropping");
        return;
    };

    match tokio::time::timeout(budget, handler.call(&cp)).await {
        Err(_) => {
            // nothing stored; the caller's reaper turns this into EXP
            debug!(msg = %cp.msg_uuid, uri = %cp.uri, "handler exceeded the call budget");
        }
        Ok(outcome) => {
            let args = match outcome {
                Ok(result) => result,
                Err(message) => match error_result(&message) {
                    Ok(args) => args,
                    Err(err) => {
                        warn!(msg = %cp.msg_uuid, %err, "could not encode error result");
                        return;
                    }
                },
            };
            if let Err(err) = broker.result(&cp, args).await {
                warn!(msg = %cp.msg_uuid, uri = %cp.uri, %err, "storing result failed");
            }
        }
    }
}

fn error_result(message: &str) -> Result<Box<RawValue>, serde_json::Error> {
    serde_json::value::to_raw_value(&serde_json::json!({
        "error": { "message": message }
    }))
}
