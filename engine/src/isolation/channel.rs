//! Request/response correlation over a frame transport
//!
//! An [`Endpoint`] is one side of a message channel. Both the host and the
//! isolation context hold one; either side can send requests and both answer
//! the other's requests through a [`RequestHandler`].
//!
//! Every request carries a fresh `messageId`. A waiter is registered under
//! that id before the frame goes out and is removed when the reply arrives,
//! when the deadline passes, or when the endpoint closes. Replies whose id has
//! no waiter are dropped.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{Frame, MessageEnvelope, ResponseEnvelope};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type Reply = Result<Value, String>;
type PendingMap = HashMap<String, oneshot::Sender<Reply>>;

/// Frames buffered in each direction
pub const FRAME_BUFFER: usize = 64;

/// Answers requests arriving from the other side
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value, String>;
}

/// One side of a message channel
pub struct Endpoint {
    outbound: mpsc::Sender<Frame>,
    pending: Arc<Mutex<PendingMap>>,
    closed: Arc<watch::Sender<bool>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

/// Two connected transports, as used by in-process contexts
pub fn frame_pair() -> (
    (mpsc::Sender<Frame>, mpsc::Receiver<Frame>),
    (mpsc::Sender<Frame>, mpsc::Receiver<Frame>),
) {
    let (a_tx, b_rx) = mpsc::channel(FRAME_BUFFER);
    let (b_tx, a_rx) = mpsc::channel(FRAME_BUFFER);
    ((a_tx, a_rx), (b_tx, b_rx))
}

impl Endpoint {
    /// Create an endpoint sending on `outbound` with a default reply deadline
    pub fn new(outbound: mpsc::Sender<Frame>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(watch::channel(false).0),
            pump: Mutex::new(None),
            timeout,
        })
    }

    /// Start reading `inbound`, routing replies to waiters and requests to
    /// `handler`
    pub fn start(&self, mut inbound: mpsc::Receiver<Frame>, handler: Arc<dyn RequestHandler>) {
        let pending = Arc::clone(&self.pending);
        let closed = Arc::clone(&self.closed);
        let outbound = self.outbound.clone();

        let task = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    Frame::Response(response) => {
                        let waiter = lock(&pending).remove(&response.message_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response.into_outcome());
                            }
                            None => tracing::debug!(
                                "Dropping reply with unknown id {}",
                                response.message_id
                            ),
                        }
                    }
                    Frame::Request(request) => {
                        let handler = Arc::clone(&handler);
                        let outbound = outbound.clone();
                        tokio::spawn(async move {
                            let outcome = handler.handle(&request.kind, request.payload).await;
                            let reply = ResponseEnvelope::from_outcome(request.message_id, outcome);
                            if outbound.send(Frame::Response(reply)).await.is_err() {
                                tracing::debug!("Reply to '{}' not delivered", request.kind);
                            }
                        });
                    }
                }
            }

            lock(&pending).clear();
            closed.send_replace(true);
        });

        *lock(&self.pump) = Some(task);
    }

    /// Send a request and wait for its reply under the default deadline
    pub async fn send(&self, kind: &str, payload: Value) -> Result<Value, EngineError> {
        self.send_with_timeout(kind, payload, self.timeout).await
    }

    /// Send a request and wait for its reply under `timeout`
    pub async fn send_with_timeout(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        if self.is_closed() {
            return Err(EngineError::ChannelClosed);
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(message_id.clone(), tx);
        if self.is_closed() {
            lock(&self.pending).remove(&message_id);
            return Err(EngineError::ChannelClosed);
        }

        let request = Frame::Request(MessageEnvelope {
            kind: kind.to_string(),
            message_id: message_id.clone(),
            payload,
        });
        // the enqueue counts against the deadline too
        let exchange = async {
            self.outbound
                .send(request)
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(EngineError::Execution(message)),
                Err(_) => Err(EngineError::ChannelClosed),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => {
                if outcome.is_err() {
                    lock(&self.pending).remove(&message_id);
                }
                outcome
            }
            Err(_) => {
                lock(&self.pending).remove(&message_id);
                Err(EngineError::timeout(
                    format!("reply to '{}'", kind),
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Requests still waiting for a reply
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the other side hangs up or `close` is called
    ///
    /// The future does not borrow the endpoint, so a watcher can outlive it.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Stop reading and fail every outstanding request with `ChannelClosed`
    pub fn close(&self) {
        self.closed.send_replace(true);
        if let Some(task) = lock(&self.pump).take() {
            task.abort();
        }
        lock(&self.pending).clear();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, kind: &str, payload: Value) -> Result<Value, String> {
            match kind {
                "echo" => Ok(payload),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(Value::Null)
                }
                other => Err(format!("Unknown request type: {}", other)),
            }
        }
    }

    fn connected(timeout_ms: u64) -> (Arc<Endpoint>, Arc<Endpoint>) {
        let ((a_tx, a_rx), (b_tx, b_rx)) = frame_pair();
        let a = Endpoint::new(a_tx, Duration::from_millis(timeout_ms));
        let b = Endpoint::new(b_tx, Duration::from_millis(timeout_ms));
        a.start(a_rx, Arc::new(Echo));
        b.start(b_rx, Arc::new(Echo));
        (a, b)
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (host, context) = connected(1000);
        assert_eq!(host.send("echo", json!({"a": 1})).await.unwrap(), json!({"a": 1}));
        assert_eq!(context.send("echo", json!("back")).await.unwrap(), json!("back"));
        assert_eq!(host.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_reply() {
        let (host, _context) = connected(1000);
        let err = host.send("nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(msg) if msg.contains("nope")));
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let (host, _context) = connected(30);
        let err = host.send("slow", Value::Null).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { millis: 30, .. }));
        assert_eq!(host.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let (host, _context) = connected(1000);
        let sends = (0..20).map(|i| {
            let host = Arc::clone(&host);
            async move { host.send("echo", json!(i)).await }
        });
        let results = futures::future::join_all(sends).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn test_stray_reply_is_dropped() {
        let (tx, mut peer_rx) = mpsc::channel(FRAME_BUFFER);
        let (peer_tx, rx) = mpsc::channel(FRAME_BUFFER);
        let host = Endpoint::new(tx, Duration::from_millis(1000));
        host.start(rx, Arc::new(Echo));

        peer_tx
            .send(Frame::Response(ResponseEnvelope::from_outcome(
                "never-issued".to_string(),
                Ok(json!(1)),
            )))
            .await
            .unwrap();

        let send = {
            let host = Arc::clone(&host);
            tokio::spawn(async move { host.send("echo", json!("real")).await })
        };
        let request = match peer_rx.recv().await.unwrap() {
            Frame::Request(request) => request,
            other => panic!("expected request, got {:?}", other),
        };
        peer_tx
            .send(Frame::Response(ResponseEnvelope::from_outcome(
                request.message_id,
                Ok(json!("answered")),
            )))
            .await
            .unwrap();

        assert_eq!(send.await.unwrap().unwrap(), json!("answered"));
    }

    #[tokio::test]
    async fn test_full_outbound_buffer_respects_deadline() {
        let (tx, _unread) = mpsc::channel(FRAME_BUFFER);
        for i in 0..FRAME_BUFFER {
            tx.try_send(Frame::Request(MessageEnvelope {
                kind: "filler".to_string(),
                message_id: i.to_string(),
                payload: Value::Null,
            }))
            .unwrap();
        }
        let (_peer_tx, rx) = mpsc::channel(FRAME_BUFFER);
        let host = Endpoint::new(tx, Duration::from_millis(5000));
        host.start(rx, Arc::new(Echo));

        let started = tokio::time::Instant::now();
        let err = host
            .send_with_timeout("stats", Value::Null, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { millis: 50, .. }));
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(host.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_resolves_when_peer_hangs_up() {
        let (host, context) = connected(1000);
        let closed = host.closed();
        drop(context);
        tokio::time::timeout(Duration::from_secs(1), closed).await.unwrap();
        assert!(host.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let (tx, _peer_rx) = mpsc::channel(FRAME_BUFFER);
        let (_peer_tx, rx) = mpsc::channel(FRAME_BUFFER);
        let host = Endpoint::new(tx, Duration::from_millis(5000));
        host.start(rx, Arc::new(Echo));

        let send = {
            let host = Arc::clone(&host);
            tokio::spawn(async move { host.send("echo", Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.close();

        assert!(matches!(send.await.unwrap(), Err(EngineError::ChannelClosed)));
        assert!(matches!(
            host.send("echo", Value::Null).await,
            Err(EngineError::ChannelClosed)
        ));
    }
}
