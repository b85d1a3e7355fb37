use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AgentError, AgentRuntime, ChatResponse, ContextSnapshot, ProposedToolCall, RunCommand,
    RunConfig, RunEvent, RunHandle, ToolBackend, ToolDef,
};

type Histories = Arc<Mutex<HashMap<String, Vec<Value>>>>;

/// Agent runtime backed by an OpenAI-compatible `/chat/completions`
/// streaming endpoint. Conversation history is kept in memory per session.
#[derive(Clone, Default)]
pub struct ChatRuntime {
    http: reqwest::Client,
    histories: Histories,
}

impl ChatRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentRuntime for ChatRuntime {
    fn start_run(&self, config: RunConfig) -> Result<RunHandle, AgentError> {
        let api_key = match &config.agent.provider.api_key_env {
            Some(var) => {
                Some(dotenv::var(var).map_err(|_| AgentError::MissingApiKey(var.clone()))?)
            }
            None => None,
        };
        let bearer = api_key
            .map(|key| HeaderValue::from_str(&format!("Bearer {key}")))
            .transpose()
            .map_err(|err| AgentError::Provider(format!("invalid API key: {err}")))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| AgentError::Unavailable)?;

        let (handle, endpoint) = RunHandle::channel();
        let run = ChatRun {
            http: self.http.clone(),
            histories: self.histories.clone(),
            run_id: Uuid::new_v4().to_string(),
            bearer,
            config,
            commands: endpoint.commands,
            events: endpoint.events,
            cancel: CancellationToken::new(),
        };
        runtime.spawn(run.drive());
        Ok(handle)
    }
}

#[derive(Debug, thiserror::Error)]
enum ChatError {
    #[error("run cancelled")]
    Cancelled,

    #[error("event receiver dropped")]
    Detached,

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider error: {0}")]
    Provider(String),
}

/// A tool call assembled from streamed fragments.
#[derive(Debug, Clone, Default, PartialEq)]
struct StreamedCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct TurnReply {
    content: String,
    calls: BTreeMap<u64, StreamedCall>,
    usage: Option<(u64, u64, u64)>,
}

impl TurnReply {
    fn assistant_message(&self) -> Value {
        let mut message = json!({
            "role": "assistant",
            "content": if self.content.is_empty() { Value::Null } else { json!(self.content) },
        });
        if !self.calls.is_empty() {
            let calls: Vec<Value> = self
                .calls
                .values()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect();
            message["tool_calls"] = json!(calls);
        }
        message
    }
}

enum Decision {
    Approved,
    Denied(String),
}

enum Next {
    Stream(Option<Result<SseEvent, reqwest_eventsource::Error>>),
    Command(Option<RunCommand>),
}

struct ChatRun {
    http: reqwest::Client,
    histories: Histories,
    run_id: String,
    bearer: Option<HeaderValue>,
    config: RunConfig,
    commands: mpsc::Receiver<RunCommand>,
    events: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
}

impl ChatRun {
    async fn drive(mut self) {
        info!(run = %self.run_id, session = %self.config.session_id, agent = %self.config.agent.name, "run started");
        let terminal = match self.execute().await {
            Ok(()) => RunEvent::RunCompleted,
            Err(ChatError::Cancelled) => RunEvent::RunCancelled,
            Err(ChatError::Detached) => {
                debug!(run = %self.run_id, "dispatcher went away");
                return;
            }
            Err(err) => {
                warn!(run = %self.run_id, error = %err, "run failed");
                RunEvent::RunFailed {
                    error: err.to_string(),
                }
            }
        };
        self.cancel.cancel();
        let _ = self.events.send(terminal).await;
    }

    async fn emit(&self, event: RunEvent) -> Result<(), ChatError> {
        self.events.send(event).await.map_err(|_| ChatError::Detached)
    }

    fn history(&self) -> Vec<Value> {
        self.histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.config.session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn save_history(&self, messages: Vec<Value>) {
        self.histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.config.session_id.clone(), messages);
    }

    fn system_message(&self) -> Option<Value> {
        let mut system = self.config.agent.system_prompt.clone().unwrap_or_default();
        if !self.config.working_dir.is_empty() {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&format!("Working directory: {}", self.config.working_dir));
        }
        (!system.is_empty()).then(|| json!({"role": "system", "content": system}))
    }

    async fn execute(&mut self) -> Result<(), ChatError> {
        self.emit(RunEvent::RunStarted {
            run_id: self.run_id.clone(),
        })
        .await?;
        if let Some(skill) = &self.config.skill {
            debug!(run = %self.run_id, skill = %skill, "prompt expanded from skill");
        }

        let mut conversation = self.history();
        conversation.push(json!({"role": "user", "content": self.config.prompt}));
        let tools = self
            .config
            .tools
            .as_ref()
            .map(|backend| backend.definitions())
            .unwrap_or_default();

        for turn in 0..self.config.agent.max_turns {
            debug!(run = %self.run_id, turn, "requesting completion");
            let reply = self.stream_turn(&conversation, &tools).await?;

            let snapshot = reply.usage.map(|(prompt, completion, total)| ContextSnapshot {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: total,
                context_size: self.config.agent.context_size,
            });
            // Content and reasoning were already streamed as deltas.
            self.emit(RunEvent::TurnCompleted {
                response: ChatResponse::default(),
                snapshot,
            })
            .await?;

            conversation.push(reply.assistant_message());
            if reply.calls.is_empty() {
                self.save_history(conversation);
                return Ok(());
            }

            let calls: Vec<StreamedCall> = reply.calls.into_values().collect();
            let results = self.run_tools(&calls).await?;
            conversation.extend(results);
        }

        warn!(run = %self.run_id, max_turns = self.config.agent.max_turns, "turn limit reached");
        self.save_history(conversation);
        Ok(())
    }

    fn request_body(&self, messages: &[Value], tools: &[ToolDef]) -> Value {
        let agent = &self.config.agent;
        let mut body_messages: Vec<Value> = self.system_message().into_iter().collect();
        body_messages.extend(messages.iter().cloned());

        let mut body = json!({
            "model": agent.provider.model,
            "messages": body_messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(temperature) = agent.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = agent.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !tools.is_empty() {
            let tools: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    /// A command arriving while no tool decision is pending. Only a cancel
    /// (or the dispatcher hanging up) matters here.
    fn idle_command(&self, command: Option<RunCommand>) -> Result<(), ChatError> {
        match command {
            Some(RunCommand::Cancel) | None => Err(ChatError::Cancelled),
            Some(other) => {
                debug!(run = %self.run_id, ?other, "ignoring command outside tool approval");
                Ok(())
            }
        }
    }

    async fn stream_turn(&mut self, messages: &[Value], tools: &[ToolDef]) -> Result<TurnReply, ChatError> {
        let provider = &self.config.agent.provider;
        let url = format!("{}/chat/completions", provider.endpoint.trim_end_matches('/'));
        let body = self.request_body(messages, tools);

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(provider.timeout_secs))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body.to_string());
        if let Some(bearer) = &self.bearer {
            request = request.header(AUTHORIZATION, bearer.clone());
        }

        let mut stream =
            EventSource::new(request).map_err(|err| ChatError::Request(err.to_string()))?;
        let mut reply = TurnReply::default();

        loop {
            let next = tokio::select! {
                event = stream.next() => Next::Stream(event),
                command = self.commands.recv() => Next::Command(command),
            };

            let event = match next {
                Next::Command(command) => {
                    if let Err(err) = self.idle_command(command) {
                        stream.close();
                        return Err(err);
                    }
                    continue;
                }
                Next::Stream(None) => break,
                Next::Stream(Some(event)) => event,
            };

            match event {
                Ok(SseEvent::Open) => debug!(run = %self.run_id, "provider stream open"),
                Ok(SseEvent::Message(message)) => {
                    if message.data.trim() == "[DONE]" {
                        break;
                    }
                    let chunk: Value = match serde_json::from_str(&message.data) {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            debug!(run = %self.run_id, error = %err, "skipping unparseable chunk");
                            continue;
                        }
                    };
                    if let Some(error) = chunk.get("error") {
                        stream.close();
                        let message = error["message"].as_str().map(String::from).unwrap_or_else(|| error.to_string());
                        return Err(ChatError::Provider(message));
                    }
                    self.apply_chunk(&chunk, &mut reply).await?;
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(err) => {
                    stream.close();
                    return Err(ChatError::Request(err.to_string()));
                }
            }
        }

        stream.close();
        Ok(reply)
    }

    async fn apply_chunk(&self, chunk: &Value, reply: &mut TurnReply) -> Result<(), ChatError> {
        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            let field = |name: &str| usage[name].as_u64().unwrap_or(0);
            reply.usage = Some((
                field("prompt_tokens"),
                field("completion_tokens"),
                field("total_tokens"),
            ));
        }

        let delta = &chunk["choices"][0]["delta"];
        let reasoning = delta["reasoning_content"]
            .as_str()
            .or_else(|| delta["reasoning"].as_str());
        if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
            self.emit(RunEvent::ReasoningDelta(reasoning.to_string())).await?;
        }

        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            reply.content.push_str(text);
            self.emit(RunEvent::TokenDelta(text.to_string())).await?;
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for fragment in tool_calls {
                let index = fragment["index"].as_u64().unwrap_or(0);
                let call = reply.calls.entry(index).or_default();
                if let Some(id) = fragment["id"].as_str() {
                    call.id = id.to_string();
                }
                if let Some(name) = fragment["function"]["name"].as_str() {
                    call.name.push_str(name);
                }
                if let Some(arguments) = fragment["function"]["arguments"].as_str() {
                    call.arguments.push_str(arguments);
                }
                if call.id.is_empty() {
                    call.id = format!("call_{index}");
                }
            }
        }
        Ok(())
    }

    fn preview(&self, call: &StreamedCall) -> Option<String> {
        let backend = self.config.tools.as_ref()?;
        let args = parse_arguments(&call.arguments).ok()?;
        backend
            .preview(&call.name, &args)
            .ok()
            .filter(|preview| !preview.is_empty())
    }

    /// Proposes the calls, waits for a decision on each, runs the approved
    /// ones and returns the tool messages for the next turn.
    async fn run_tools(&mut self, calls: &[StreamedCall]) -> Result<Vec<Value>, ChatError> {
        let proposed: Vec<ProposedToolCall> = calls
            .iter()
            .map(|call| ProposedToolCall {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments_json: call.arguments.clone(),
                preview: self.preview(call),
            })
            .collect();
        self.emit(RunEvent::ToolsProposed(proposed)).await?;

        let mut decisions: HashMap<String, Decision> = HashMap::new();
        while calls.iter().any(|call| !decisions.contains_key(&call.id)) {
            match self.commands.recv().await {
                Some(RunCommand::ApproveTool { call_id }) => {
                    decisions.insert(call_id, Decision::Approved);
                }
                Some(RunCommand::DenyTool { call_id, reason }) => {
                    decisions.insert(call_id, Decision::Denied(reason));
                }
                Some(RunCommand::Cancel) | None => return Err(ChatError::Cancelled),
            }
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let content = match decisions.remove(&call.id) {
                Some(Decision::Approved) => {
                    self.emit(RunEvent::ToolStarted {
                        call_id: call.id.clone(),
                    })
                    .await?;
                    match self.execute_tool(call).await? {
                        Ok(output) => {
                            self.emit(RunEvent::ToolCompleted {
                                call_id: call.id.clone(),
                                output: output.clone(),
                            })
                            .await?;
                            output
                        }
                        Err(error) => {
                            self.emit(RunEvent::ToolFailed {
                                call_id: call.id.clone(),
                                error: error.clone(),
                            })
                            .await?;
                            format!("error: {error}")
                        }
                    }
                }
                Some(Decision::Denied(reason)) => format!("tool call denied: {reason}"),
                None => "tool call denied".to_string(),
            };
            results.push(json!({"role": "tool", "tool_call_id": call.id, "content": content}));
        }

        self.emit(RunEvent::ToolsCompleted).await?;
        Ok(results)
    }

    /// Runs one approved call. The outer error aborts the run; the inner one
    /// is reported to the model as a failed tool call.
    async fn execute_tool(&mut self, call: &StreamedCall) -> Result<Result<String, String>, ChatError> {
        let Some(backend) = self.config.tools.clone() else {
            return Ok(Err(format!("no tool backend available for {}", call.name)));
        };
        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(err) => return Ok(Err(err)),
        };

        let cancel = self.cancel.child_token();
        let execution = execute_on(backend, &call.name, &args, &cancel);
        tokio::pin!(execution);

        loop {
            tokio::select! {
                result = &mut execution => {
                    return Ok(result.map_err(|err| err.to_string()));
                }
                command = self.commands.recv() => {
                    if let Err(err) = self.idle_command(command) {
                        cancel.cancel();
                        let _ = (&mut execution).await;
                        return Err(err);
                    }
                }
            }
        }
    }
}

async fn execute_on(
    backend: Arc<dyn ToolBackend>,
    name: &str,
    args: &Map<String, Value>,
    cancel: &CancellationToken,
) -> Result<String, super::ToolError> {
    backend.execute(name, args, cancel).await
}

fn parse_arguments(arguments: &str) -> Result<Map<String, Value>, String> {
    if arguments.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(err) => Err(format!("invalid tool arguments: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ToolError;
    use crate::config::{AgentConfig, ProviderConfig};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct Calculator;

    #[async_trait]
    impl ToolBackend for Calculator {
        async fn execute(
            &self,
            name: &str,
            args: &Map<String, Value>,
            _cancel: &CancellationToken,
        ) -> Result<String, ToolError> {
            match name {
                "add" => {
                    let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                    Ok(sum.to_string())
                }
                other => Err(ToolError::Unknown(other.to_string())),
            }
        }

        fn definitions(&self) -> Vec<ToolDef> {
            vec![ToolDef {
                name: "add".to_string(),
                description: "Add two integers".to_string(),
                parameters: json!({"type": "object", "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}}),
            }]
        }

        fn preview(&self, _name: &str, _args: &Map<String, Value>) -> Result<String, ToolError> {
            Ok("a + b".to_string())
        }
    }

    fn agent(endpoint: &str) -> AgentConfig {
        AgentConfig {
            name: "test".to_string(),
            display_name: None,
            system_prompt: Some("Be brief.".to_string()),
            provider: ProviderConfig {
                endpoint: endpoint.to_string(),
                model: "tiny".to_string(),
                api_key_env: None,
                timeout_secs: 10,
            },
            temperature: Some(0.5),
            max_tokens: None,
            max_turns: 4,
            context_size: 8192,
        }
    }

    fn run_config(endpoint: &str, prompt: &str, tools: Option<Arc<dyn ToolBackend>>) -> RunConfig {
        RunConfig {
            prompt: prompt.to_string(),
            session_id: "sess-1".to_string(),
            agent: agent(endpoint),
            working_dir: String::new(),
            skill: None,
            tools,
        }
    }

    async fn read_request_body(socket: &mut TcpStream) -> Value {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return Value::Null;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return serde_json::from_slice(&buf[end + 4..end + 4 + length]).unwrap_or(Value::Null);
            }
        }
    }

    /// Serves one canned event stream per accepted connection and reports
    /// each request body.
    async fn serve(responses: Vec<Vec<Value>>) -> (String, mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (bodies, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for events in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let body = read_request_body(&mut socket).await;
                let _ = bodies.send(body);

                let mut payload = String::from(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n",
                );
                for event in events {
                    payload.push_str(&format!("data: {event}\n\n"));
                }
                payload.push_str("data: [DONE]\n\n");
                socket.write_all(payload.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}/v1"), rx)
    }

    fn text_chunk(text: &str) -> Value {
        json!({"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]})
    }

    async fn next_event(handle: &mut RunHandle) -> RunEvent {
        tokio::time::timeout(Duration::from_secs(5), handle.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn streams_text_and_reports_usage() {
        let (endpoint, mut bodies) = serve(vec![vec![
            text_chunk("Hel"),
            text_chunk("lo"),
            json!({"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 2, "total_tokens": 14}}),
        ]])
        .await;

        let runtime = ChatRuntime::new();
        let mut handle = runtime.start_run(run_config(&endpoint, "hi", None)).unwrap();

        assert!(matches!(next_event(&mut handle).await, RunEvent::RunStarted { .. }));
        assert_eq!(next_event(&mut handle).await, RunEvent::TokenDelta("Hel".to_string()));
        assert_eq!(next_event(&mut handle).await, RunEvent::TokenDelta("lo".to_string()));
        assert_eq!(
            next_event(&mut handle).await,
            RunEvent::TurnCompleted {
                response: ChatResponse::default(),
                snapshot: Some(ContextSnapshot {
                    prompt_tokens: 12,
                    completion_tokens: 2,
                    total_tokens: 14,
                    context_size: 8192,
                }),
            }
        );
        assert_eq!(next_event(&mut handle).await, RunEvent::RunCompleted);

        let body = bodies.recv().await.unwrap();
        assert_eq!(body["model"], "tiny");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "Be brief."}));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "hi"}));
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn approved_tool_call_runs_and_feeds_the_next_turn() {
        let (endpoint, mut bodies) = serve(vec![
            vec![
                json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_9", "function": {"name": "add", "arguments": "{\"a\": 2,"}}]}}]}),
                json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": " \"b\": 40}"}}]}, "finish_reason": "tool_calls"}]}),
            ],
            vec![text_chunk("The answer is 42.")],
        ])
        .await;

        let runtime = ChatRuntime::new();
        let mut handle = runtime
            .start_run(run_config(&endpoint, "add 2 and 40", Some(Arc::new(Calculator))))
            .unwrap();

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut handle).await;
            if let RunEvent::ToolsProposed(calls) = &event {
                assert_eq!(
                    calls,
                    &vec![ProposedToolCall {
                        call_id: "call_9".to_string(),
                        name: "add".to_string(),
                        arguments_json: "{\"a\": 2, \"b\": 40}".to_string(),
                        preview: Some("a + b".to_string()),
                    }]
                );
                handle
                    .commands
                    .send(RunCommand::ApproveTool {
                        call_id: "call_9".to_string(),
                    })
                    .await
                    .unwrap();
            }
            let done = event == RunEvent::RunCompleted;
            seen.push(event);
            if done {
                break;
            }
        }

        assert!(seen.contains(&RunEvent::ToolStarted {
            call_id: "call_9".to_string()
        }));
        assert!(seen.contains(&RunEvent::ToolCompleted {
            call_id: "call_9".to_string(),
            output: "42".to_string()
        }));
        assert!(seen.contains(&RunEvent::ToolsCompleted));
        assert!(seen.contains(&RunEvent::TokenDelta("The answer is 42.".to_string())));

        let first = bodies.recv().await.unwrap();
        assert_eq!(first["tools"][0]["function"]["name"], "add");
        let second = bodies.recv().await.unwrap();
        let messages = second["messages"].as_array().unwrap();
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_9");
        assert_eq!(
            messages[3],
            json!({"role": "tool", "tool_call_id": "call_9", "content": "42"})
        );
    }

    #[tokio::test]
    async fn cancel_while_awaiting_approval_ends_the_run() {
        let (endpoint, _bodies) = serve(vec![vec![json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "add", "arguments": "{}"}}]}}]})]]).await;

        let runtime = ChatRuntime::new();
        let mut handle = runtime
            .start_run(run_config(&endpoint, "add", Some(Arc::new(Calculator))))
            .unwrap();

        loop {
            match next_event(&mut handle).await {
                RunEvent::ToolsProposed(_) => {
                    handle.commands.send(RunCommand::Cancel).await.unwrap();
                }
                RunEvent::RunCancelled => break,
                RunEvent::RunCompleted | RunEvent::RunFailed { .. } => panic!("run should be cancelled"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn history_carries_into_the_next_prompt() {
        let (endpoint, mut bodies) = serve(vec![vec![text_chunk("first answer")], vec![text_chunk("second answer")]]).await;
        let runtime = ChatRuntime::new();

        let mut handle = runtime.start_run(run_config(&endpoint, "one", None)).unwrap();
        while next_event(&mut handle).await != RunEvent::RunCompleted {}
        let mut handle = runtime.start_run(run_config(&endpoint, "two", None)).unwrap();
        while next_event(&mut handle).await != RunEvent::RunCompleted {}

        let _ = bodies.recv().await.unwrap();
        let second = bodies.recv().await.unwrap();
        let roles: Vec<&str> = second["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(second["messages"][2]["content"], "first answer");
    }

    #[tokio::test]
    async fn provider_error_fails_the_run() {
        let (endpoint, _bodies) = serve(vec![vec![json!({"error": {"message": "model returned error"}})]]).await;
        let runtime = ChatRuntime::new();
        let mut handle = runtime.start_run(run_config(&endpoint, "hi", None)).unwrap();

        loop {
            match next_event(&mut handle).await {
                RunEvent::RunFailed { error } => {
                    assert_eq!(error, "provider error: model returned error");
                    break;
                }
                RunEvent::RunCompleted => panic!("run should fail"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn missing_api_key_refuses_to_start() {
        let mut config = run_config("http://127.0.0.1:9/v1", "hi", None);
        config.agent.provider.api_key_env = Some("AGENTD_TEST_KEY_THAT_IS_NOT_SET".to_string());

        let err = ChatRuntime::new().start_run(config).unwrap_err();
        assert!(matches!(err, AgentError::MissingApiKey(var) if var == "AGENTD_TEST_KEY_THAT_IS_NOT_SET"));
    }

    #[test]
    fn arguments_must_be_an_object() {
        assert_eq!(parse_arguments("").unwrap(), Map::new());
        assert!(parse_arguments("[1]").is_err());
        assert!(parse_arguments("{oops").unwrap_err().starts_with("invalid tool arguments"));
    }
}
