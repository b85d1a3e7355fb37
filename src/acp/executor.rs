use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transport::Connection;
use super::types::*;
use crate::agent::{ToolBackend, ToolDef, ToolError};

/// Upper bound for the kill/release calls made while tearing a terminal down.
const TERMINAL_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tool backend that runs tools on the client through reverse requests.
///
/// Only tools backed by a declared client capability are offered or executed.
pub struct ToolExecutor {
    conn: Connection,
    session_id: SessionId,
    capabilities: ClientCapabilities,
}

#[derive(Deserialize)]
struct ReadFileArgs {
    #[serde(default)]
    path: String,
    line: Option<u32>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct WriteFileArgs {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct RunCommandArgs {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<String>,
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: &Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|err| ToolError::InvalidArguments(format!("{tool}: {err}")))
}

impl ToolExecutor {
    pub fn new(conn: Connection, session_id: SessionId, capabilities: ClientCapabilities) -> Self {
        Self {
            conn,
            session_id,
            capabilities,
        }
    }

    fn supports(&self, tool: &str) -> bool {
        match tool {
            "read_file" => self.capabilities.fs.read_text_file,
            "write_file" => self.capabilities.fs.write_text_file,
            "run_command" => self.capabilities.terminal,
            _ => false,
        }
    }

    async fn read_file(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let args: ReadFileArgs = parse_args("read_file", args)?;
        if args.path.is_empty() {
            return Err(ToolError::InvalidArguments("read_file requires path".to_string()));
        }

        let request = ReadTextFileRequest {
            session_id: self.session_id.clone(),
            path: args.path,
            line: args.line,
            limit: args.limit,
        };
        let response: ReadTextFileResponse = self
            .conn
            .request_cancellable(methods::FS_READ_TEXT_FILE, &request, cancel)
            .await?;
        Ok(response.content)
    }

    async fn write_file(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let args: WriteFileArgs = parse_args("write_file", args)?;
        if args.path.is_empty() {
            return Err(ToolError::InvalidArguments("write_file requires path".to_string()));
        }

        let request = WriteTextFileRequest {
            session_id: self.session_id.clone(),
            path: args.path,
            content: args.content,
        };
        // Clients may answer with `null` or `{}`.
        let _: Value = self
            .conn
            .request_cancellable(methods::FS_WRITE_TEXT_FILE, &request, cancel)
            .await?;
        Ok(format!("wrote to {}", request.path))
    }

    /// create -> wait_for_exit -> output -> release. The terminal is always
    /// released once created, and killed first if the call was cancelled.
    async fn run_command(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let args: RunCommandArgs = parse_args("run_command", args)?;
        if args.command.is_empty() {
            return Err(ToolError::InvalidArguments(
                "run_command requires command".to_string(),
            ));
        }

        let request = CreateTerminalRequest {
            session_id: self.session_id.clone(),
            command: args.command,
            args: args.args,
            cwd: args.cwd,
            env: Vec::new(),
            output_byte_limit: None,
        };
        let created: CreateTerminalResponse = self
            .conn
            .request_cancellable(methods::TERMINAL_CREATE, &request, cancel)
            .await?;

        let terminal = TerminalRequest {
            session_id: self.session_id.clone(),
            terminal_id: created.terminal_id,
        };
        let outcome = self.collect_output(&terminal, cancel).await;

        if matches!(outcome, Err(ToolError::Cancelled)) {
            self.cleanup(methods::TERMINAL_KILL, &terminal).await;
        }
        self.cleanup(methods::TERMINAL_RELEASE, &terminal).await;
        outcome
    }

    async fn collect_output(
        &self,
        terminal: &TerminalRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let exit: TerminalExitStatus = self
            .conn
            .request_cancellable(methods::TERMINAL_WAIT_FOR_EXIT, terminal, cancel)
            .await?;
        let output: TerminalOutputResponse = self
            .conn
            .request_cancellable(methods::TERMINAL_OUTPUT, terminal, cancel)
            .await?;
        Ok(format_command_output(&output, &exit))
    }

    async fn cleanup(&self, method: &str, terminal: &TerminalRequest) {
        let call = self.conn.request::<_, Value>(method, terminal);
        match tokio::time::timeout(TERMINAL_CLEANUP_TIMEOUT, call).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(method, terminal = %terminal.terminal_id, error = %err, "terminal cleanup failed"),
            Err(_) => debug!(method, terminal = %terminal.terminal_id, "terminal cleanup timed out"),
        }
    }
}

fn format_command_output(output: &TerminalOutputResponse, exit: &TerminalExitStatus) -> String {
    let mut text = output.output.clone();
    if let Some(code) = exit.exit_code.filter(|code| *code != 0) {
        text.push_str(&format!("\n[exit code: {code}]"));
    }
    if let Some(signal) = &exit.signal {
        text.push_str(&format!("\n[signal: {signal}]"));
    }
    if output.truncated {
        text.push_str("\n[output truncated]");
    }
    text
}

#[async_trait]
impl ToolBackend for ToolExecutor {
    async fn execute(
        &self,
        name: &str,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        if !matches!(name, "read_file" | "write_file" | "run_command") {
            return Err(ToolError::Unknown(name.to_string()));
        }
        if !self.supports(name) {
            return Err(ToolError::Unavailable(name.to_string()));
        }

        debug!(tool = name, session = %self.session_id, "delegating tool call to client");
        match name {
            "read_file" => self.read_file(args, cancel).await,
            "write_file" => self.write_file(args, cancel).await,
            _ => self.run_command(args, cancel).await,
        }
    }

    fn definitions(&self) -> Vec<ToolDef> {
        let mut defs = Vec::new();

        if self.capabilities.fs.read_text_file {
            defs.push(ToolDef {
                name: "read_file".to_string(),
                description: "Read the contents of a text file. Returns the file content as a string."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Absolute path to the file to read"},
                        "line": {"type": "integer", "description": "Line number to start reading from (1-based)"},
                        "limit": {"type": "integer", "description": "Maximum number of lines to read"}
                    },
                    "required": ["path"]
                }),
            });
        }

        if self.capabilities.fs.write_text_file {
            defs.push(ToolDef {
                name: "write_file".to_string(),
                description: "Write text content to a file. Creates or overwrites the file at the given path."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Absolute path to the file to write"},
                        "content": {"type": "string", "description": "The text content to write to the file"}
                    },
                    "required": ["path", "content"]
                }),
            });
        }

        if self.capabilities.terminal {
            defs.push(ToolDef {
                name: "run_command".to_string(),
                description: "Execute a shell command and return its output.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "The command to execute"},
                        "args": {"type": "array", "items": {"type": "string"}, "description": "Command arguments"},
                        "cwd": {"type": "string", "description": "Working directory (absolute path)"}
                    },
                    "required": ["command"]
                }),
            });
        }

        defs
    }

    /// Delegated tools have no local preview.
    fn preview(&self, _name: &str, _args: &Map<String, Value>) -> Result<String, ToolError> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::error::RpcError;
    use crate::acp::transport::MethodHandler;
    use std::sync::{Arc, Mutex};

    /// Client side of the connection: answers fs and terminal calls.
    struct FakeClient {
        calls: Mutex<Vec<(String, Value)>>,
        exit: Value,
        hang_on_wait: bool,
    }

    #[async_trait]
    impl MethodHandler for FakeClient {
        async fn handle(
            &self,
            _conn: &Connection,
            method: &str,
            params: Option<Value>,
            cancel: CancellationToken,
        ) -> Result<Value, RpcError> {
            let params = params.unwrap_or(Value::Null);
            self.calls.lock().unwrap().push((method.to_string(), params.clone()));
            match method {
                "fs/read_text_file" => Ok(json!({"content": format!("contents of {}", params["path"].as_str().unwrap_or(""))})),
                "fs/write_text_file" => Ok(Value::Null),
                "terminal/create" => Ok(json!({"terminalId": "term-1"})),
                "terminal/wait_for_exit" => {
                    if self.hang_on_wait {
                        cancel.cancelled().await;
                    }
                    Ok(self.exit.clone())
                }
                "terminal/output" => Ok(json!({"output": "out", "truncated": true})),
                "terminal/kill" | "terminal/release" => Ok(json!({})),
                other => Err(RpcError::method_not_found(format!("unknown method: {other}"))),
            }
        }
    }

    struct Silent;

    #[async_trait]
    impl MethodHandler for Silent {
        async fn handle(
            &self,
            _conn: &Connection,
            method: &str,
            _params: Option<Value>,
            _cancel: CancellationToken,
        ) -> Result<Value, RpcError> {
            Err(RpcError::method_not_found(format!("unknown method: {method}")))
        }
    }

    fn all_capabilities() -> ClientCapabilities {
        ClientCapabilities {
            fs: FileSystemCapability {
                read_text_file: true,
                write_text_file: true,
            },
            terminal: true,
        }
    }

    fn setup(caps: ClientCapabilities, exit: Value, hang_on_wait: bool) -> (ToolExecutor, Arc<FakeClient>) {
        let client = Arc::new(FakeClient {
            calls: Mutex::new(Vec::new()),
            exit,
            hang_on_wait,
        });
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let server = Connection::new(Arc::new(Silent), ar, aw);
        let _client_conn = Connection::new(client.clone(), br, bw);
        (ToolExecutor::new(server, "sess-1".to_string(), caps), client)
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn methods_called(client: &FakeClient) -> Vec<String> {
        client.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    #[tokio::test]
    async fn definitions_follow_capabilities() {
        let caps = ClientCapabilities {
            fs: FileSystemCapability {
                read_text_file: true,
                write_text_file: false,
            },
            terminal: true,
        };
        let (executor, _) = setup(caps, json!({}), false);
        let names: Vec<String> = executor.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["read_file", "run_command"]);
    }

    #[tokio::test]
    async fn read_file_forwards_window() {
        let (executor, client) = setup(all_capabilities(), json!({}), false);
        let out = executor
            .execute(
                "read_file",
                &args(json!({"path": "/tmp/a.txt", "line": 3, "limit": 10})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, "contents of /tmp/a.txt");

        let calls = client.calls.lock().unwrap();
        assert_eq!(
            calls[0].1,
            json!({"sessionId": "sess-1", "path": "/tmp/a.txt", "line": 3, "limit": 10})
        );
    }

    #[tokio::test]
    async fn write_file_reports_path() {
        let (executor, client) = setup(all_capabilities(), json!({}), false);
        let out = executor
            .execute(
                "write_file",
                &args(json!({"path": "/tmp/out.txt", "content": "hi"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, "wrote to /tmp/out.txt");
        assert_eq!(client.calls.lock().unwrap()[0].1["content"], "hi");
    }

    #[tokio::test]
    async fn run_command_walks_terminal_lifecycle() {
        let (executor, client) = setup(all_capabilities(), json!({"exitCode": 2}), false);
        let out = executor
            .execute(
                "run_command",
                &args(json!({"command": "make", "args": ["test"], "cwd": "/src"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out, "out\n[exit code: 2]\n[output truncated]");
        assert_eq!(
            methods_called(&client),
            vec![
                "terminal/create",
                "terminal/wait_for_exit",
                "terminal/output",
                "terminal/release"
            ]
        );
        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0].1["args"], json!(["test"]));
        assert_eq!(calls[3].1, json!({"sessionId": "sess-1", "terminalId": "term-1"}));
    }

    #[test]
    fn zero_exit_code_adds_no_marker() {
        let output = TerminalOutputResponse {
            output: "ok".to_string(),
            truncated: false,
            exit_status: None,
        };
        let exit = TerminalExitStatus {
            exit_code: Some(0),
            signal: None,
        };
        assert_eq!(format_command_output(&output, &exit), "ok");

        let killed = TerminalExitStatus {
            exit_code: None,
            signal: Some("SIGKILL".to_string()),
        };
        assert_eq!(format_command_output(&output, &killed), "ok\n[signal: SIGKILL]");
    }

    #[test]
    fn negative_exit_code_is_reported() {
        let output = TerminalOutputResponse {
            output: "boom".to_string(),
            truncated: true,
            exit_status: None,
        };
        let exit: TerminalExitStatus = serde_json::from_value(json!({"exitCode": -1})).unwrap();
        assert_eq!(
            format_command_output(&output, &exit),
            "boom\n[exit code: -1]\n[output truncated]"
        );

        let windows: TerminalExitStatus =
            serde_json::from_value(json!({"exitCode": 3221225477u64})).unwrap();
        assert_eq!(windows.exit_code, Some(3221225477));
    }

    #[tokio::test]
    async fn cancelled_command_is_killed_and_released() {
        let (executor, client) = setup(all_capabilities(), json!({}), true);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = executor
            .execute("run_command", &args(json!({"command": "sleep"})), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
        assert_eq!(
            methods_called(&client),
            vec![
                "terminal/create",
                "terminal/wait_for_exit",
                "terminal/kill",
                "terminal/release"
            ]
        );
    }

    #[tokio::test]
    async fn undeclared_capability_is_refused() {
        let caps = ClientCapabilities {
            fs: FileSystemCapability {
                read_text_file: true,
                write_text_file: false,
            },
            terminal: false,
        };
        let (executor, client) = setup(caps, json!({}), false);
        let cancel = CancellationToken::new();

        let err = executor
            .execute("write_file", &args(json!({"path": "/x", "content": ""})), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unavailable(name) if name == "write_file"));

        let err = executor
            .execute("grep", &args(json!({})), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unknown(_)));

        let err = executor
            .execute("read_file", &args(json!({})), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments: read_file requires path");
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preview_is_always_empty() {
        let (executor, _) = setup(all_capabilities(), json!({}), false);
        assert_eq!(executor.preview("write_file", &Map::new()).unwrap(), "");
    }
}
