use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{RpcError, TransportError};
use super::types::{JsonRpcMessage, RequestId};

/// Largest inbound frame accepted, in bytes.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ReplySlot = oneshot::Sender<Result<Value, TransportError>>;

/// Receives inbound requests and notifications for one connection.
///
/// `cancel` is cancelled when the connection goes away. For requests the
/// returned value (or error) is written back to the peer; for notifications
/// it is discarded.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(
        &self,
        conn: &Connection,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, RpcError>;

    /// Runs after the response to a `method` request has been written.
    fn responded(&self, _conn: &Connection, _method: &str) {}
}

/// Duplex JSON-RPC connection over a newline-delimited JSON byte stream.
///
/// Both sides of the stream are symmetric: either end may issue requests and
/// notifications, and either end answers requests through its handler.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<i64, ReplySlot>>,
    next_id: AtomicI64,
    /// Fires once the read loop has ended and every pending call was failed.
    closed: CancellationToken,
    /// Asks the read loop to stop.
    shutdown: CancellationToken,
}

impl Connection {
    /// Wraps a byte stream and starts decoding inbound frames on a background
    /// task. Must be called from within a tokio runtime.
    pub fn new<R, W>(handler: Arc<dyn MethodHandler>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Self {
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(Box::new(writer)),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                closed: CancellationToken::new(),
                shutdown: CancellationToken::new(),
            }),
        };

        tokio::spawn(conn.clone().read_loop(handler, reader));
        conn
    }

    /// Sends a request and waits for the matching response.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R, TransportError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.request_cancellable(method, params, &CancellationToken::new())
            .await
    }

    /// Like [`Connection::request`], but gives up with
    /// [`TransportError::Cancelled`] as soon as `cancel` fires.
    pub async fn request_cancellable<P, R>(
        &self,
        method: &str,
        params: P,
        cancel: &CancellationToken,
    ) -> Result<R, TransportError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.call(method, params, cancel).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Sends a notification. Returns once the frame is written.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), TransportError> {
        let params = serde_json::to_value(params)?;
        self.write(&JsonRpcMessage::notification(method, Some(params)))
            .await
    }

    /// Resolves once the peer has gone away or [`Connection::close`] was called.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Stops reading, shuts down the write half and waits for pending calls
    /// to be failed.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.shutdown().await {
                debug!(error = %err, "writer shutdown failed");
            }
        }
        self.closed().await;
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        let _slot = PendingSlot { conn: self, id };

        debug!(id, method, "sending request");
        self.write(&JsonRpcMessage::request(
            RequestId::Number(id),
            method,
            Some(params),
        ))
        .await?;

        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or(Err(TransportError::Closed)),
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = self.inner.closed.cancelled() => Err(TransportError::Closed),
        }
    }

    async fn write(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let mut frame = serde_json::to_vec(message)?;
        frame.push(b'\n');

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<i64, ReplySlot>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_loop<R>(self, handler: Arc<dyn MethodHandler>, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        let (notifications, queue) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().notification_worker(handler.clone(), queue));

        loop {
            let frame = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                frame = frames.next() => frame,
            };

            let line = match frame {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!(error = %err, "unreadable frame, closing connection");
                    break;
                }
                None => break,
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(message) => self.route(message, &handler, &notifications),
                Err(err) => warn!(error = %err, "dropping malformed frame"),
            }
        }

        let abandoned: Vec<ReplySlot> = self.pending().drain().map(|(_, slot)| slot).collect();
        for slot in abandoned {
            let _ = slot.send(Err(TransportError::Closed));
        }
        self.inner.closed.cancel();
        debug!("connection closed");
    }

    fn route(
        &self,
        message: JsonRpcMessage,
        handler: &Arc<dyn MethodHandler>,
        notifications: &mpsc::UnboundedSender<(String, Option<Value>)>,
    ) {
        match (message.id, message.method) {
            (Some(id), None) => {
                let outcome = match message.error {
                    Some(err) => Err(TransportError::Rpc(err)),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                self.deliver(id, outcome);
            }
            (Some(id), Some(method)) => {
                let conn = self.clone();
                let handler = handler.clone();
                let params = message.params;
                tokio::spawn(async move {
                    let cancel = conn.inner.closed.child_token();
                    let outcome = handler.handle(&conn, &method, params, cancel).await;
                    if let Err(err) = outcome.as_ref() {
                        debug!(method, code = err.code, message = %err.message, "request failed");
                    }
                    match conn.write(&JsonRpcMessage::response(id, outcome)).await {
                        Ok(()) => handler.responded(&conn, &method),
                        Err(err) => warn!(method, error = %err, "failed to write response"),
                    }
                });
            }
            (None, Some(method)) => {
                let _ = notifications.send((method, message.params));
            }
            (None, None) => warn!("dropping frame with neither id nor method"),
        }
    }

    fn deliver(&self, id: RequestId, outcome: Result<Value, TransportError>) {
        let slot = match id {
            RequestId::Number(id) => self.pending().remove(&id),
            RequestId::String(_) => None,
        };
        match slot {
            Some(slot) => {
                let _ = slot.send(outcome);
            }
            None => debug!(?id, "dropping unmatched response"),
        }
    }

    /// Runs notification handlers one at a time, in arrival order, off the
    /// read loop.
    async fn notification_worker(
        self,
        handler: Arc<dyn MethodHandler>,
        mut queue: mpsc::UnboundedReceiver<(String, Option<Value>)>,
    ) {
        while let Some((method, params)) = queue.recv().await {
            let cancel = self.inner.closed.child_token();
            if let Err(err) = handler.handle(&self, &method, params, cancel).await {
                debug!(method, error = %err, "notification handler failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

/// Deregisters a reply slot when the waiting call returns or is dropped.
struct PendingSlot<'a> {
    conn: &'a Connection,
    id: i64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.conn.pending().remove(&self.id);
    }
}

/// Decodes request parameters, reporting failures as invalid params.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| RpcError::invalid_params(format!("invalid params: {err}")))
}
