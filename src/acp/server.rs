use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::RpcError;
use super::executor::ToolExecutor;
use super::session::{RunTicket, SessionState};
use super::transport::{parse_params, Connection, MethodHandler};
use super::types::*;
use crate::agent::{AgentRuntime, ProposedToolCall, RunCommand, RunConfig, RunEvent, RunHandle, ToolBackend};
use crate::config::AgentRegistry;
use crate::skills::{self, SkillRegistry};

fn reply<T: Serialize>(value: T) -> Result<Value, RpcError> {
    Ok(serde_json::to_value(value)?)
}

/// Ends the session's run when the prompt call returns or is dropped.
struct RunGuard<'a>(&'a SessionState, RunTicket);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.end_run(self.1);
    }
}

/// Server side of one client connection: sessions, prompt runs, and the
/// permission round trip for proposed tool calls.
pub struct Handler {
    runtime: Arc<dyn AgentRuntime>,
    agents: Arc<AgentRegistry>,
    skills: Option<Arc<SkillRegistry>>,
    default_agent: String,
    sessions: RwLock<HashMap<SessionId, Arc<SessionState>>>,
    capabilities: std::sync::RwLock<ClientCapabilities>,
}

impl Handler {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        agents: Arc<AgentRegistry>,
        skills: Option<Arc<SkillRegistry>>,
        default_agent: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            agents,
            skills,
            default_agent: default_agent.into(),
            sessions: RwLock::new(HashMap::new()),
            capabilities: std::sync::RwLock::new(ClientCapabilities::default()),
        }
    }

    /// Routes one inbound method.
    pub async fn dispatch(
        &self,
        conn: &Connection,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, RpcError> {
        match method {
            methods::INITIALIZE => reply(self.initialize(params)?),
            methods::AUTHENTICATE => reply(AuthenticateResponse::default()),
            methods::SESSION_NEW => reply(self.new_session(conn, params).await?),
            methods::SESSION_LOAD => reply(self.load_session(params).await?),
            methods::SESSION_PROMPT => reply(self.prompt(conn, params, cancel).await?),
            methods::SESSION_CANCEL => {
                self.cancel(params).await?;
                Ok(Value::Null)
            }
            methods::SESSION_SET_MODE => reply(SetSessionModeResponse::default()),
            methods::SESSION_SET_CONFIG_OPTION => reply(SetSessionConfigOptionResponse::default()),
            other if other.starts_with('_') => Err(RpcError::method_not_found(format!(
                "unknown extension: {other}"
            ))),
            other => Err(RpcError::method_not_found(format!("unknown method: {other}"))),
        }
    }

    fn capabilities(&self) -> ClientCapabilities {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn initialize(&self, params: Option<Value>) -> Result<InitializeResponse, RpcError> {
        let request: InitializeRequest = match params {
            None | Some(Value::Null) => InitializeRequest::default(),
            params => parse_params(params)?,
        };

        info!(
            client = request.client_info.as_ref().map(|c| c.name.as_str()).unwrap_or("unknown"),
            fs_read = request.client_capabilities.fs.read_text_file,
            fs_write = request.client_capabilities.fs.write_text_file,
            terminal = request.client_capabilities.terminal,
            "client initialized"
        );
        *self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner) = request.client_capabilities;

        Ok(InitializeResponse {
            protocol_version: ProtocolVersion::CURRENT,
            agent_capabilities: AgentCapabilities {
                load_session: true,
                ..Default::default()
            },
            agent_info: Some(Implementation {
                name: "agentd".to_string(),
                title: Some("Agentd".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            auth_methods: Vec::new(),
        })
    }

    async fn new_session(
        &self,
        conn: &Connection,
        params: Option<Value>,
    ) -> Result<NewSessionResponse, RpcError> {
        let request: NewSessionRequest = parse_params(params)?;
        let agent_name = request
            .agent_name()
            .unwrap_or(&self.default_agent)
            .to_string();
        let session_id = Uuid::new_v4().to_string();

        info!(session = %session_id, agent = %agent_name, cwd = %request.cwd, "session created");
        self.sessions.write().await.insert(
            session_id.clone(),
            Arc::new(SessionState::new(session_id.clone(), agent_name, request.cwd)),
        );

        if let Some(skills) = &self.skills {
            let commands: Vec<AvailableCommand> = skills
                .user_invocable()
                .map(|skill| AvailableCommand {
                    name: skill.name.clone(),
                    description: skill.description.clone(),
                })
                .collect();
            if !commands.is_empty() {
                send_update(
                    conn,
                    &session_id,
                    SessionUpdate::AvailableCommandsUpdate {
                        available_commands: commands,
                    },
                )
                .await;
            }
        }

        Ok(NewSessionResponse { session_id })
    }

    async fn load_session(&self, params: Option<Value>) -> Result<LoadSessionResponse, RpcError> {
        let request: LoadSessionRequest = parse_params(params)?;

        info!(session = %request.session_id, "session loaded");
        self.sessions.write().await.insert(
            request.session_id.clone(),
            Arc::new(SessionState::new(
                request.session_id.clone(),
                self.default_agent.clone(),
                request.cwd,
            )),
        );

        Ok(LoadSessionResponse {
            session_id: request.session_id,
        })
    }

    async fn session(&self, session_id: &str) -> Option<Arc<SessionState>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn prompt(
        &self,
        conn: &Connection,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<PromptResponse, RpcError> {
        let request: PromptRequest = parse_params(params)?;
        let session = self
            .session(&request.session_id)
            .await
            .ok_or_else(|| RpcError::not_found("session not found"))?;

        let mut prompt = extract_text(&request.prompt);
        let mut skill_name = None;
        if prompt.starts_with('/') {
            if let Some(registry) = &self.skills {
                let (name, args) = skills::parse_invocation(&prompt);
                if let Some(skill) = registry.get(name).filter(|s| s.user_invocable) {
                    let rendered = skill.render(args).map_err(|err| {
                        RpcError::invalid_params(format!("failed to render skill: {err}"))
                    })?;
                    skill_name = Some(skill.name.clone());
                    prompt = skill.format_content(&rendered);
                }
            }
        }

        let agent = self
            .agents
            .load(&session.agent_name)
            .map_err(|err| RpcError::invalid_params(err.to_string()))?;

        let run_cancel = cancel.child_token();

        let capabilities = self.capabilities();
        let tools = if capabilities.supports_delegated_tools() {
            Some(Arc::new(ToolExecutor::new(
                conn.clone(),
                session.session_id.clone(),
                capabilities,
            )) as Arc<dyn ToolBackend>)
        } else {
            None
        };

        let config = RunConfig {
            prompt,
            session_id: session.session_id.clone(),
            agent,
            working_dir: session.cwd.clone(),
            skill: skill_name,
            tools,
        };
        debug!(?config, "starting run");

        let RunHandle {
            commands,
            mut events,
        } = self.runtime.start_run(config).map_err(|err| {
            run_cancel.cancel();
            RpcError::internal(err.to_string())
        })?;

        let ticket = session.start_run(commands, run_cancel.clone());
        let _guard = RunGuard(&session, ticket);

        let stop_reason = self
            .forward_events(conn, &session, ticket, &mut events, &run_cancel)
            .await?;
        info!(session = %session.session_id, ?stop_reason, "prompt finished");
        Ok(PromptResponse::new(stop_reason))
    }

    async fn forward_events(
        &self,
        conn: &Connection,
        session: &SessionState,
        ticket: RunTicket,
        events: &mut mpsc::Receiver<RunEvent>,
        run_cancel: &CancellationToken,
    ) -> Result<StopReason, RpcError> {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(StopReason::EndTurn);
                    };
                    if let Some(stop_reason) = self.process_event(conn, session, ticket, event, run_cancel).await? {
                        return Ok(stop_reason);
                    }
                }
                _ = conn.closed() => {
                    info!(session = %session.session_id, "peer disconnected, cancelling run");
                    session.try_cancel(ticket);
                    return Ok(StopReason::Cancelled);
                }
                _ = run_cancel.cancelled() => {
                    info!(session = %session.session_id, "run context cancelled");
                    session.try_cancel(ticket);
                    return Ok(StopReason::Cancelled);
                }
            }
        }
    }

    /// Translates one run event. `Some` ends the prompt with that stop reason.
    async fn process_event(
        &self,
        conn: &Connection,
        session: &SessionState,
        ticket: RunTicket,
        event: RunEvent,
        run_cancel: &CancellationToken,
    ) -> Result<Option<StopReason>, RpcError> {
        let sid = &session.session_id;
        match event {
            RunEvent::RunStarted { run_id } => {
                debug!(session = %sid, run = %run_id, "run started");
            }
            RunEvent::TokenDelta(text) => {
                send_update(conn, sid, SessionUpdate::AgentMessageChunk {
                    content: ContentBlock::text(text),
                })
                .await;
            }
            RunEvent::ReasoningDelta(text) => {
                send_update(conn, sid, SessionUpdate::AgentThoughtChunk {
                    content: ContentBlock::text(text),
                })
                .await;
            }
            RunEvent::TurnCompleted { response, snapshot } => {
                if !response.reasoning.is_empty() {
                    send_update(conn, sid, SessionUpdate::AgentThoughtChunk {
                        content: ContentBlock::text(response.reasoning),
                    })
                    .await;
                }
                if !response.content.is_empty() {
                    send_update(conn, sid, SessionUpdate::AgentMessageChunk {
                        content: ContentBlock::text(response.content),
                    })
                    .await;
                }
                if let Some(snapshot) = snapshot {
                    let notification = ContextNotification {
                        session_id: sid.clone(),
                        snapshot,
                    };
                    if let Err(err) = conn.notify(methods::EXT_CONTEXT, &notification).await {
                        warn!(session = %sid, error = %err, "failed to send context snapshot");
                    }
                }
            }
            RunEvent::ToolsProposed(calls) => {
                for call in calls {
                    self.review_tool_call(conn, session, ticket, call, run_cancel).await;
                }
            }
            RunEvent::ToolStarted { call_id } => {
                send_update(conn, sid, SessionUpdate::ToolCallUpdate(ToolCallUpdate {
                    tool_call_id: call_id,
                    status: Some(ToolCallStatus::InProgress),
                    content: None,
                    raw_output: None,
                }))
                .await;
            }
            RunEvent::ToolCompleted { call_id, output } => {
                send_update(conn, sid, SessionUpdate::ToolCallUpdate(ToolCallUpdate {
                    tool_call_id: call_id,
                    status: Some(ToolCallStatus::Completed),
                    content: Some(vec![ToolCallContent::text(output.clone())]),
                    raw_output: Some(serde_json::json!({ "content": output })),
                }))
                .await;
            }
            RunEvent::ToolFailed { call_id, error } => {
                send_update(conn, sid, SessionUpdate::ToolCallUpdate(ToolCallUpdate {
                    tool_call_id: call_id,
                    status: Some(ToolCallStatus::Failed),
                    content: Some(vec![ToolCallContent::text(error.clone())]),
                    raw_output: Some(serde_json::json!({ "error": error })),
                }))
                .await;
            }
            RunEvent::ToolsCompleted => {}
            RunEvent::RunCompleted => return Ok(Some(StopReason::EndTurn)),
            RunEvent::RunCancelled => return Ok(Some(StopReason::Cancelled)),
            RunEvent::RunFailed { error } => {
                warn!(session = %sid, error = %error, "run failed");
                return Err(RpcError::internal(error));
            }
        }
        Ok(None)
    }

    /// Announces a proposed call, asks the client for permission and relays
    /// the decision to the run.
    async fn review_tool_call(
        &self,
        conn: &Connection,
        session: &SessionState,
        ticket: RunTicket,
        call: ProposedToolCall,
        run_cancel: &CancellationToken,
    ) {
        let sid = &session.session_id;
        let raw_input = parse_raw_input(&call.arguments_json);
        let kind = ToolKind::from_tool_name(&call.name);

        send_update(conn, sid, SessionUpdate::ToolCall(ToolCall {
            tool_call_id: call.call_id.clone(),
            title: call.name.clone(),
            kind,
            status: ToolCallStatus::Pending,
            content: Vec::new(),
            raw_input: raw_input.clone(),
        }))
        .await;

        let request = RequestPermissionRequest {
            session_id: sid.clone(),
            tool_call: ToolCallDetail {
                tool_call_id: call.call_id.clone(),
                title: Some(call.name.clone()),
                kind: Some(kind),
                status: Some(ToolCallStatus::Pending),
                raw_input,
                preview: call.preview.as_deref().and_then(parse_preview),
            },
            options: permission_options(),
        };

        let response = conn
            .request_cancellable::<_, RequestPermissionResponse>(
                methods::SESSION_REQUEST_PERMISSION,
                &request,
                run_cancel,
            )
            .await;

        let command = match response {
            Ok(response) if response.outcome.is_allowed(&request.options) => {
                RunCommand::ApproveTool {
                    call_id: call.call_id,
                }
            }
            Ok(response) => {
                let reason = match response.outcome {
                    RequestPermissionOutcome::Cancelled => "cancelled",
                    RequestPermissionOutcome::Selected { .. } => "denied by user",
                };
                RunCommand::DenyTool {
                    call_id: call.call_id,
                    reason: reason.to_string(),
                }
            }
            Err(err) => {
                warn!(session = %sid, tool = %call.name, error = %err, "permission request failed");
                RunCommand::DenyTool {
                    call_id: call.call_id,
                    reason: "permission request failed".to_string(),
                }
            }
        };

        debug!(session = %sid, ?command, "relaying permission decision");
        session.send_run_command(ticket, command).await;
    }

    async fn cancel(&self, params: Option<Value>) -> Result<(), RpcError> {
        let notification: CancelNotification = parse_params(params)?;
        match self.session(&notification.session_id).await {
            Some(session) => match session.try_send_command(RunCommand::Cancel) {
                Ok(delivered) => {
                    debug!(session = %notification.session_id, delivered, "cancel requested");
                }
                // A backed-up run must not hold the notification queue.
                Err(command) => {
                    let session_id = notification.session_id;
                    tokio::spawn(async move {
                        let delivered = session.send_command(command).await;
                        debug!(session = %session_id, delivered, "cancel requested after backlog");
                    });
                }
            },
            None => debug!(session = %notification.session_id, "cancel for unknown session"),
        }
        Ok(())
    }
}

#[async_trait]
impl MethodHandler for Handler {
    async fn handle(
        &self,
        conn: &Connection,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, RpcError> {
        self.dispatch(conn, method, params, cancel).await
    }
}

async fn send_update(conn: &Connection, session_id: &str, update: SessionUpdate) {
    let notification = SessionNotification {
        session_id: session_id.to_string(),
        update,
    };
    if let Err(err) = conn.notify(methods::SESSION_UPDATE, &notification).await {
        warn!(session = %session_id, error = %err, "failed to send session update");
    }
}

fn permission_options() -> Vec<PermissionOption> {
    vec![
        PermissionOption {
            option_id: "allow".to_string(),
            name: "Allow".to_string(),
            kind: PermissionOptionKind::AllowOnce,
        },
        PermissionOption {
            option_id: "reject".to_string(),
            name: "Reject".to_string(),
            kind: PermissionOptionKind::RejectOnce,
        },
    ]
}

/// Joins the non-empty text blocks of a prompt with newlines.
fn extract_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(ContentBlock::as_text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_raw_input(arguments_json: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(arguments_json) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn parse_preview(preview: &str) -> Option<Value> {
    if preview.is_empty() {
        return None;
    }
    Some(serde_json::from_str(preview).unwrap_or_else(|_| Value::String(preview.to_string())))
}
