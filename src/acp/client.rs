use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{RpcError, TransportError};
use super::transport::{parse_params, Connection, MethodHandler};
use super::types::*;

type UpdateFn = dyn Fn(SessionNotification) + Send + Sync;
type PermissionFn = dyn Fn(RequestPermissionRequest) -> RequestPermissionOutcome + Send + Sync;
type ContextFn = dyn Fn(ContextNotification) + Send + Sync;

/// Callbacks invoked for server-initiated traffic.
#[derive(Clone, Default)]
pub struct ClientHooks {
    on_update: Option<Arc<UpdateFn>>,
    on_permission: Option<Arc<PermissionFn>>,
    on_context: Option<Arc<ContextFn>>,
}

impl ClientHooks {
    pub fn on_update(mut self, f: impl Fn(SessionNotification) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    /// Decides permission requests. Without one every request is answered
    /// with a cancelled outcome.
    pub fn on_permission(
        mut self,
        f: impl Fn(RequestPermissionRequest) -> RequestPermissionOutcome + Send + Sync + 'static,
    ) -> Self {
        self.on_permission = Some(Arc::new(f));
        self
    }

    pub fn on_context(mut self, f: impl Fn(ContextNotification) + Send + Sync + 'static) -> Self {
        self.on_context = Some(Arc::new(f));
        self
    }
}

#[async_trait]
impl MethodHandler for ClientHooks {
    async fn handle(
        &self,
        _conn: &Connection,
        method: &str,
        params: Option<Value>,
        _cancel: CancellationToken,
    ) -> Result<Value, RpcError> {
        match method {
            methods::SESSION_UPDATE => {
                let notification: SessionNotification = parse_params(params)?;
                if let Some(f) = &self.on_update {
                    f(notification);
                }
                Ok(Value::Null)
            }
            methods::SESSION_REQUEST_PERMISSION => {
                let request: RequestPermissionRequest = parse_params(params)?;
                let outcome = match &self.on_permission {
                    Some(f) => f(request),
                    None => RequestPermissionOutcome::Cancelled,
                };
                Ok(serde_json::to_value(RequestPermissionResponse { outcome })?)
            }
            methods::EXT_CONTEXT => {
                let notification: ContextNotification = parse_params(params)?;
                if let Some(f) = &self.on_context {
                    f(notification);
                }
                Ok(Value::Null)
            }
            other => {
                debug!(method = other, "client does not handle method");
                Err(RpcError::method_not_found(format!("unknown method: {other}")))
            }
        }
    }
}

/// Client end of an agentd connection.
#[derive(Clone)]
pub struct AcpClient {
    conn: Connection,
}

impl AcpClient {
    pub fn new<R, W>(reader: R, writer: W, hooks: ClientHooks) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            conn: Connection::new(Arc::new(hooks), reader, writer),
        }
    }

    pub async fn connect_tcp(addr: &str, hooks: ClientHooks) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, hooks))
    }

    pub async fn initialize(
        &self,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResponse, TransportError> {
        let request = InitializeRequest {
            protocol_version: ProtocolVersion::CURRENT,
            client_capabilities: capabilities,
            client_info: Some(Implementation {
                name: "agentd-cli".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        };
        self.conn.request(methods::INITIALIZE, &request).await
    }

    /// Opens a session, optionally bound to a named agent.
    pub async fn new_session(
        &self,
        cwd: &str,
        agent: Option<&str>,
    ) -> Result<NewSessionResponse, TransportError> {
        let request = NewSessionRequest {
            cwd: cwd.to_string(),
            mcp_servers: Vec::new(),
            meta: agent.map(|name| {
                let mut meta = serde_json::Map::new();
                meta.insert("agentName".to_string(), json!(name));
                meta
            }),
        };
        self.conn.request(methods::SESSION_NEW, &request).await
    }

    pub async fn load_session(
        &self,
        session_id: &str,
        cwd: &str,
    ) -> Result<LoadSessionResponse, TransportError> {
        let request = LoadSessionRequest {
            session_id: session_id.to_string(),
            cwd: cwd.to_string(),
            mcp_servers: Vec::new(),
        };
        self.conn.request(methods::SESSION_LOAD, &request).await
    }

    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<PromptResponse, TransportError> {
        let request = PromptRequest {
            session_id: session_id.to_string(),
            prompt: vec![ContentBlock::text(text)],
        };
        self.conn.request(methods::SESSION_PROMPT, &request).await
    }

    pub async fn cancel(&self, session_id: &str) -> Result<(), TransportError> {
        let notification = CancelNotification {
            session_id: session_id.to_string(),
        };
        self.conn.notify(methods::SESSION_CANCEL, &notification).await
    }

    pub async fn status(&self) -> Result<StatusResponse, TransportError> {
        self.conn.request(methods::EXT_STATUS, json!({})).await
    }

    pub async fn shutdown(&self) -> Result<ShutdownResponse, TransportError> {
        self.conn.request(methods::EXT_SHUTDOWN, json!({})).await
    }

    pub async fn closed(&self) {
        self.conn.closed().await
    }

    pub async fn close(&self) {
        self.conn.close().await
    }
}
