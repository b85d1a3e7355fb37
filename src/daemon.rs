//! Process-level serving: TCP and stdio listeners, the `_agentd/status` and
//! `_agentd/shutdown` extensions, and graceful shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::{methods, Connection, Handler, MethodHandler, RpcError, ShutdownResponse, StatusResponse};
use crate::agent::AgentRuntime;
use crate::config::{AgentRegistry, ConfigError, ServerConfig};
use crate::skills::SkillRegistry;

/// Upper bound on how long live connections get to wind down.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Daemon {
    config: ServerConfig,
    runtime: Arc<dyn AgentRuntime>,
    agents: Arc<AgentRegistry>,
    skills: Option<Arc<SkillRegistry>>,
    started_at: DateTime<Utc>,
    started: Instant,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Prepares the data directory and loads agents and skills.
    pub fn new(config: ServerConfig, runtime: Arc<dyn AgentRuntime>) -> Result<Self, ConfigError> {
        let agents = AgentRegistry::new(config.agents_dir());
        agents.ensure_default()?;
        match agents.list() {
            Ok(names) => info!(?names, "agents available"),
            Err(err) => warn!(error = %err, "could not list agents"),
        }

        let skills = match SkillRegistry::load(&config.skills_dir()) {
            Ok(skills) if skills.is_empty() => None,
            Ok(skills) => {
                info!(count = skills.len(), "skills loaded");
                Some(Arc::new(skills))
            }
            Err(err) => {
                warn!(error = %err, "skills disabled");
                None
            }
        };

        Ok(Self {
            config,
            runtime,
            agents: Arc::new(agents),
            skills,
            started_at: Utc::now(),
            started: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelling this token stops the listener and drains connections.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn dispatcher(self: &Arc<Self>, bind: &str) -> Arc<ServerDispatch> {
        Arc::new(ServerDispatch {
            daemon: self.clone(),
            bind: bind.to_string(),
            handler: Handler::new(
                self.runtime.clone(),
                self.agents.clone(),
                self.skills.clone(),
                self.config.default_agent.clone(),
            ),
        })
    }

    fn status(&self, bind: &str) -> StatusResponse {
        StatusResponse {
            bind: bind.to_string(),
            uptime: format_uptime(self.started.elapsed()),
            started_at: self.started_at.to_rfc3339(),
            data_dir: self.config.data_dir.display().to_string(),
        }
    }

    /// Accepts connections until shutdown, then closes every live
    /// connection and waits up to [`DRAIN_TIMEOUT`] for them.
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let bind = listener.local_addr()?.to_string();
        info!(%bind, "listening");

        let mut live: Vec<Connection> = Vec::new();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    info!(%peer, "connection accepted");
                    let (reader, writer) = stream.into_split();
                    let conn = Connection::new(self.dispatcher(&bind), reader, writer);

                    live.retain(|conn| !conn.is_closed());
                    live.push(conn.clone());
                    tasks.spawn(async move {
                        conn.closed().await;
                        info!(%peer, "connection closed");
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        info!(connections = live.iter().filter(|c| !c.is_closed()).count(), "shutting down");
        drain(live).await;
        tasks.abort_all();
        Ok(())
    }

    /// Serves a single connection over stdin/stdout until the peer closes
    /// the stream or shutdown is requested.
    pub async fn serve_stdio(self: Arc<Self>) {
        let conn = Connection::new(
            self.dispatcher("stdio"),
            tokio::io::stdin(),
            tokio::io::stdout(),
        );
        info!("serving on stdio");

        tokio::select! {
            _ = conn.closed() => debug!("stdio peer closed"),
            _ = self.shutdown.cancelled() => drain(vec![conn.clone()]).await,
        }
    }
}

async fn drain(connections: Vec<Connection>) {
    let closing = futures::future::join_all(connections.iter().map(|conn| conn.close()));
    if tokio::time::timeout(DRAIN_TIMEOUT, closing).await.is_err() {
        warn!("connections did not drain in time");
    }
}

/// Per-connection method router: daemon extensions first, everything else
/// goes to the protocol [`Handler`].
struct ServerDispatch {
    daemon: Arc<Daemon>,
    bind: String,
    handler: Handler,
}

#[async_trait]
impl MethodHandler for ServerDispatch {
    async fn handle(
        &self,
        conn: &Connection,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, RpcError> {
        match method {
            methods::EXT_STATUS => Ok(serde_json::to_value(self.daemon.status(&self.bind))?),
            methods::EXT_SHUTDOWN => {
                info!("shutdown requested by client");
                Ok(serde_json::to_value(ShutdownResponse {
                    message: "shutting down".to_string(),
                })?)
            }
            _ => self.handler.dispatch(conn, method, params, cancel).await,
        }
    }

    /// Shutdown starts only once its reply is on the wire.
    fn responded(&self, _conn: &Connection, method: &str) {
        if method == methods::EXT_SHUTDOWN {
            self.daemon.shutdown.cancel();
        }
    }
}

/// Renders a duration as `1h2m3s`, dropping leading zero units.
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::{AcpClient, ClientCapabilities, ClientHooks, TransportError};
    use crate::agent::{AgentError, RunConfig, RunHandle};

    struct NoRuntime;

    impl AgentRuntime for NoRuntime {
        fn start_run(&self, _config: RunConfig) -> Result<RunHandle, AgentError> {
            Err(AgentError::Unavailable)
        }
    }

    async fn start() -> (tempfile::TempDir, String, CancellationToken, tokio::task::JoinHandle<std::io::Result<()>>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            default_agent: "default".to_string(),
        };
        let daemon = Arc::new(Daemon::new(config, Arc::new(NoRuntime)).unwrap());
        let token = daemon.shutdown_token();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(daemon.serve_tcp(listener));
        (dir, addr, token, server)
    }

    #[test]
    fn uptime_drops_leading_zero_units() {
        assert_eq!(format_uptime(Duration::from_secs(7)), "7s");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1m1s");
        assert_eq!(format_uptime(Duration::from_secs(3600 + 120 + 3)), "1h2m3s");
    }

    #[tokio::test]
    async fn new_writes_the_default_agent() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            default_agent: "default".to_string(),
        };
        Daemon::new(config, Arc::new(NoRuntime)).unwrap();
        assert!(dir.path().join("agents").join("default.json").is_file());
    }

    #[tokio::test]
    async fn status_reports_bind_and_data_dir() {
        let (dir, addr, token, server) = start().await;

        let client = AcpClient::connect_tcp(&addr, ClientHooks::default()).await.unwrap();
        client.initialize(ClientCapabilities::default()).await.unwrap();
        let status = client.status().await.unwrap();
        assert_eq!(status.bind, addr);
        assert_eq!(status.data_dir, dir.path().display().to_string());
        assert!(status.uptime.ends_with('s'));
        assert!(DateTime::parse_from_rfc3339(&status.started_at).is_ok());
        assert!(!token.is_cancelled());

        token.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_method_stops_the_server_and_closes_clients() {
        let (_dir, addr, _token, server) = start().await;

        let client = AcpClient::connect_tcp(&addr, ClientHooks::default()).await.unwrap();
        let response = client.shutdown().await.unwrap();
        assert_eq!(response.message, "shutting down");

        tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn protocol_methods_reach_the_handler() {
        let (_dir, addr, token, server) = start().await;

        let client = AcpClient::connect_tcp(&addr, ClientHooks::default()).await.unwrap();
        let init = client.initialize(ClientCapabilities::default()).await.unwrap();
        assert_eq!(init.agent_info.map(|info| info.name), Some("agentd".to_string()));

        let session = client.new_session("/tmp", None).await.unwrap();
        let err = client.prompt(&session.session_id, "hi").await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc(_)));

        token.cancel();
        server.await.unwrap().unwrap();
    }
}
