//! Contract between the protocol layer and whatever drives the model.
//!
//! A runtime is handed a [`RunConfig`] and returns a [`RunHandle`]: a bounded
//! command sink and a bounded event source. Nothing here knows about the wire.

pub mod chat;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::acp::TransportError;
use crate::config::AgentConfig;

pub use chat::ChatRuntime;

/// Capacity of the command sink handed to the dispatcher.
pub const COMMAND_BUFFER: usize = 16;
/// Capacity of the event source handed to the dispatcher.
pub const EVENT_BUFFER: usize = 32;

/// A tool call the model wants to make. Never modified after it is proposed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments_json: String,
    pub preview: Option<String>,
}

/// Text produced by a turn that was not already streamed as deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub reasoning: String,
}

/// Token usage reported at the end of a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub context_size: u64,
}

/// Events emitted by a run, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted { run_id: String },
    TokenDelta(String),
    ReasoningDelta(String),
    TurnCompleted {
        response: ChatResponse,
        snapshot: Option<ContextSnapshot>,
    },
    ToolsProposed(Vec<ProposedToolCall>),
    ToolStarted { call_id: String },
    ToolCompleted { call_id: String, output: String },
    ToolFailed { call_id: String, error: String },
    ToolsCompleted,
    RunCompleted,
    RunCancelled,
    RunFailed { error: String },
}

/// Commands accepted by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCommand {
    ApproveTool { call_id: String },
    DenyTool { call_id: String, reason: String },
    Cancel,
}

/// The dispatcher's side of a run.
#[derive(Debug)]
pub struct RunHandle {
    pub commands: mpsc::Sender<RunCommand>,
    pub events: mpsc::Receiver<RunEvent>,
}

/// The runtime's side of a run.
#[derive(Debug)]
pub struct RunEndpoint {
    pub commands: mpsc::Receiver<RunCommand>,
    pub events: mpsc::Sender<RunEvent>,
}

impl RunHandle {
    /// Creates both ends of a run with the standard buffer sizes.
    pub fn channel() -> (RunHandle, RunEndpoint) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        (
            RunHandle {
                commands: command_tx,
                events: event_rx,
            },
            RunEndpoint {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

/// Everything a runtime needs to execute one prompt.
#[derive(Clone)]
pub struct RunConfig {
    pub prompt: String,
    pub session_id: String,
    pub agent: AgentConfig,
    pub working_dir: String,
    /// Skill the prompt was expanded from, if it was a slash invocation.
    pub skill: Option<String>,
    /// Tool backend chosen for this run. `None` leaves tools to the runtime.
    pub tools: Option<Arc<dyn ToolBackend>>,
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("session_id", &self.session_id)
            .field("agent", &self.agent.name)
            .field("working_dir", &self.working_dir)
            .field("skill", &self.skill)
            .field("delegated_tools", &self.tools.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("missing API key: environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("invalid provider configuration: {0}")]
    Provider(String),

    #[error("runtime is shutting down")]
    Unavailable,
}

/// Starts runs. Implementations own the model loop.
pub trait AgentRuntime: Send + Sync {
    fn start_run(&self, config: RunConfig) -> Result<RunHandle, AgentError>;
}

/// Tool definition handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("tool not available: {0}")]
    Unavailable(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool call cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for ToolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => ToolError::Cancelled,
            other => ToolError::Transport(other),
        }
    }
}

/// A place tools run. The runtime does not know which backend it was given.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError>;

    fn definitions(&self) -> Vec<ToolDef>;

    fn preview(&self, name: &str, args: &Map<String, Value>) -> Result<String, ToolError>;
}
