//! Process backend: runs the local agent binary once per request.
//!
//! The agent is invoked in print mode (`-p`) with the rendered prompt as the
//! last positional argument. Non-streaming runs use `--output-format json` and
//! parse one result object; streaming runs use `--output-format stream-json`
//! and decode stdout line by line.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use openbridge_protocol::anthropic::{
    ContentBlock, MessagesRequest, NativeMessage, Role, StopReason, StreamEvent, Usage,
};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{decode_stream_event, Backend, BackendEvent, BackendResult, EventStream, Execution};
use crate::config::{BackendKind, ProxyConfig};
use crate::error::ProxyError;

pub struct CliBackend {
    binary: PathBuf,
    timeout: Duration,
    partial_messages: bool,
}

impl CliBackend {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            binary: config.cli_binary.clone(),
            timeout: Duration::from_secs(config.cli_timeout_secs),
            partial_messages: config.cli_partial_messages,
        }
    }

    fn command(&self, request: &MessagesRequest, streaming: bool) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p").arg("--model").arg(&request.model);
        if let Some(system) = request.system.as_deref().filter(|s| !s.trim().is_empty()) {
            cmd.arg("--system-prompt").arg(system);
        }
        if streaming {
            cmd.args(["--output-format", "stream-json", "--verbose"]);
            if self.partial_messages {
                cmd.arg("--include-partial-messages");
            }
        } else {
            cmd.args(["--output-format", "json"]);
        }
        // Options end here; a prompt starting with `-` stays positional.
        cmd.arg("--").arg(render_prompt(&request.messages));

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, err: std::io::Error) -> ProxyError {
        ProxyError::backend(
            format!("failed to start {}", self.binary.display()),
            &err.to_string(),
        )
    }

    fn timeout_error(&self) -> ProxyError {
        warn!(secs = self.timeout.as_secs(), "agent process timed out, killed");
        ProxyError::Timeout {
            secs: self.timeout.as_secs(),
        }
    }

    async fn run_to_completion(&self, mut cmd: Command) -> Result<BackendResult, ProxyError> {
        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        // On timeout the child is dropped with the future and killed.
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProxyError::backend("agent process failed", &e.to_string()));
            }
            Err(_) => return Err(self.timeout_error()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout
            } else {
                stderr
            };
            return Err(exit_error(output.status, &detail));
        }
        parse_result_output(&stdout)
    }

    fn run_streaming(&self, mut cmd: Command) -> Result<EventStream, ProxyError> {
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Internal("agent stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProxyError::Internal("agent stderr was not captured".to_string()))?;
        let stderr_task = tokio::spawn(drain(stderr));

        let deadline = Instant::now() + self.timeout;
        let timeout_secs = self.timeout.as_secs();

        Ok(Box::pin(stream! {
            // Dropping the stream early (client gone) drops `child`, which kills it.
            let mut child = child;
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            let mut decoder = CliStreamDecoder::default();

            loop {
                buf.clear();
                match timeout_at(deadline, reader.read_until(b'\n', &mut buf)).await {
                    Ok(Ok(0)) => break,
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        yield Err(ProxyError::backend("failed to read agent output", &e.to_string()));
                        return;
                    }
                    Err(_) => {
                        let _ = child.start_kill();
                        warn!(secs = timeout_secs, "agent process timed out, killed");
                        yield Err(ProxyError::Timeout { secs: timeout_secs });
                        return;
                    }
                }
                let line = match std::str::from_utf8(&buf) {
                    Ok(line) => line,
                    Err(err) => {
                        debug!(error = %err, "skipping non-UTF-8 agent output line");
                        continue;
                    }
                };
                match decoder.decode_line(line) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(err) => {
                        let _ = child.start_kill();
                        yield Err(err);
                        return;
                    }
                }
            }

            let status = match timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    yield Err(ProxyError::backend("agent process failed", &e.to_string()));
                    return;
                }
                Err(_) => {
                    let _ = child.start_kill();
                    yield Err(ProxyError::Timeout { secs: timeout_secs });
                    return;
                }
            };
            if !status.success() {
                let stderr = stderr_task.await.unwrap_or_default();
                yield Err(exit_error(status, &stderr));
            }
        }))
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }

    async fn execute(
        &self,
        request: MessagesRequest,
        streaming: bool,
    ) -> Result<Execution, ProxyError> {
        info!(
            binary = %self.binary.display(),
            model = %request.model,
            streaming,
            "spawning agent process"
        );
        let cmd = self.command(&request, streaming);
        if streaming {
            self.run_streaming(cmd).map(Execution::Streaming)
        } else {
            self.run_to_completion(cmd).await.map(Execution::Completed)
        }
    }
}

/// Flatten a native conversation into the single prompt the agent accepts.
///
/// A lone user text message is passed verbatim. Anything else becomes a
/// `User:` / `Assistant:` transcript with bracketed markers for images and
/// tool traffic.
pub fn render_prompt(messages: &[NativeMessage]) -> String {
    if let [only] = messages {
        if only.role == Role::User
            && only
                .content
                .iter()
                .all(|b| matches!(b, ContentBlock::Text { .. }))
        {
            return join_blocks(&only.content);
        }
    }

    messages
        .iter()
        .map(|message| {
            let speaker = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{speaker}: {}", join_blocks(&message.content))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn join_blocks(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(ContentBlock::to_plaintext)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn exit_error(status: ExitStatus, stderr: &str) -> ProxyError {
    warn!(%status, "agent process exited with failure");
    ProxyError::backend(format!("agent exited with {status}"), stderr)
}

async fn drain(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    if let Err(err) = stderr.read_to_end(&mut buf).await {
        debug!(error = %err, "failed to read agent stderr");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// One line of agent output (`json` prints one, `stream-json` prints many).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliLine {
    StreamEvent {
        event: serde_json::Value,
    },
    Assistant {
        message: CliAssistantMessage,
    },
    Result(CliResult),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CliAssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct CliResult {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl CliResult {
    fn failed(&self) -> bool {
        self.is_error
            || self
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"))
    }

    fn into_error(self) -> ProxyError {
        let detail = self
            .result
            .or(self.subtype)
            .unwrap_or_else(|| "unknown error".to_string());
        ProxyError::backend("agent reported an error", &detail)
    }

    fn reported_usage(&self) -> Option<Usage> {
        self.usage
            .filter(|u| u.input_tokens > 0 || u.output_tokens > 0)
    }
}

/// Interpret the stdout of a non-streaming run.
///
/// A result object (or an array of messages containing one) is used when
/// present, a missing `result` field meaning an empty reply. Any other output
/// is taken verbatim as the reply text.
fn parse_result_output(stdout: &str) -> Result<BackendResult, ProxyError> {
    let trimmed = stdout.trim();
    let parsed = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .rev()
            .find_map(|item| match serde_json::from_value(item) {
                Ok(CliLine::Result(result)) => Some(result),
                _ => None,
            }),
        Ok(value @ serde_json::Value::Object(_)) => match serde_json::from_value(value) {
            Ok(CliLine::Result(result)) => Some(result),
            _ => None,
        },
        _ => None,
    };

    let Some(result) = parsed else {
        debug!("agent output is not a result object, using raw text");
        return Ok(BackendResult {
            content: vec![ContentBlock::text(trimmed)],
            stop_reason: None,
            usage: None,
        });
    };

    if result.failed() {
        return Err(result.into_error());
    }
    let usage = result.reported_usage();
    Ok(BackendResult {
        content: vec![ContentBlock::text(result.result.unwrap_or_default())],
        stop_reason: Some(StopReason::EndTurn),
        usage,
    })
}

/// Line decoder for `stream-json` output.
///
/// Only text is relayed: the agent runs its own tools internally, so its
/// tool invocations (and the `tool_use` stop reasons between its turns) are
/// not client tool calls.
#[derive(Debug, Default)]
struct CliStreamDecoder {
    saw_partial: bool,
}

impl CliStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<BackendEvent>, ProxyError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let parsed: CliLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(error = %err, "skipping unparseable agent output line");
                return Ok(Vec::new());
            }
        };

        match parsed {
            CliLine::StreamEvent { event } => {
                self.saw_partial = true;
                let event: StreamEvent = match serde_json::from_value(event) {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(error = %err, "skipping unknown agent stream event");
                        return Ok(Vec::new());
                    }
                };
                Ok(decode_stream_event(event)?
                    .into_iter()
                    .filter(|e| match e {
                        BackendEvent::Text(_) | BackendEvent::Usage(_) => true,
                        BackendEvent::Stop(reason) => *reason != StopReason::ToolUse,
                        BackendEvent::ToolCallStart { .. } | BackendEvent::ToolArgumentDelta(_) => {
                            false
                        }
                    })
                    .collect())
            }
            CliLine::Assistant { message } if !self.saw_partial => Ok(message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if !text.is_empty() => {
                        Some(BackendEvent::Text(text))
                    }
                    _ => None,
                })
                .collect()),
            CliLine::Result(result) if result.failed() => Err(result.into_error()),
            CliLine::Result(result) => Ok(result
                .reported_usage()
                .map(BackendEvent::Usage)
                .into_iter()
                .collect()),
            CliLine::Assistant { .. } | CliLine::Other => Ok(Vec::new()),
        }
    }
}
