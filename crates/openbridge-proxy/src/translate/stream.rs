//! Streaming relay: backend events in, OpenAI chunk frames out.
//!
//! Every stream has the same shape on the wire:
//!
//! ```text
//! data: {"choices":[{"delta":{"role":"assistant","content":""},...}],...}
//!
//! data: {"choices":[{"delta":{"content":"Hel"},...}],...}
//!
//! data: {"choices":[{"delta":{},"finish_reason":"stop"}],...}
//!
//! data: [DONE]
//!
//! ```
//!
//! The finish chunk and the `[DONE]` sentinel are written exactly once, also
//! when the backend fails halfway.

use std::collections::BTreeMap;

use actix_web::web::Bytes;
use async_stream::stream;
use futures::{Stream, StreamExt};
use openbridge_protocol::anthropic::{StopReason, Usage as NativeUsage};
use openbridge_protocol::openai::{
    ChatCompletionChunk, ChatDelta, ChunkChoice, ErrorResponse, FinishReason, FunctionCallDelta,
    ToolCallDelta,
};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::{completion_id, finish_reason, unix_now, usage};
use crate::admission::AdmissionSlot;
use crate::backend::BackendEvent;
use crate::error::ProxyError;

/// One `data:` frame of the event stream.
#[derive(Debug, Clone)]
pub enum SseFrame {
    Chunk(ChatCompletionChunk),
    Error(ErrorResponse),
    Done,
}

impl SseFrame {
    pub fn encode(&self) -> String {
        match self {
            SseFrame::Chunk(chunk) => data_frame(chunk),
            SseFrame::Error(err) => data_frame(err),
            SseFrame::Done => "data: [DONE]\n\n".to_string(),
        }
    }
}

fn data_frame<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("data: {json}\n\n"),
        Err(err) => {
            error!(error = %err, "failed to serialize stream frame");
            "data: {\"error\":{\"message\":\"frame serialization failed\",\"type\":\"server_error\"}}\n\n"
                .to_string()
        }
    }
}

#[derive(Debug, Clone)]
struct ToolCallEntry {
    id: String,
    name: String,
}

#[derive(Debug, Default)]
struct StreamState {
    role_sent: bool,
    tool_calls: BTreeMap<u32, ToolCallEntry>,
    open_tool: Option<u32>,
    stop_reason: Option<StopReason>,
    emitted_content: bool,
    reported_usage: NativeUsage,
    generated: String,
}

/// Per-request translator state machine.
#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    created: i64,
    model: String,
    include_usage: bool,
    prompt_estimate: u32,
    state: StreamState,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>, include_usage: bool, prompt_estimate: u32) -> Self {
        Self {
            id: completion_id("chatcmpl"),
            created: unix_now(),
            model: model.into(),
            include_usage,
            prompt_estimate,
            state: StreamState::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn emitted_content(&self) -> bool {
        self.state.emitted_content
    }

    /// The opening chunk announcing the assistant role.
    pub fn role_chunk(&mut self) -> ChatCompletionChunk {
        self.state.role_sent = true;
        self.chunk(
            ChatDelta {
                role: Some("assistant"),
                content: Some(String::new()),
                tool_calls: None,
            },
            None,
        )
    }

    /// Feed one backend event; returns the chunk to send, if any.
    pub fn on_event(&mut self, event: BackendEvent) -> Option<ChatCompletionChunk> {
        debug_assert!(self.state.role_sent, "role chunk must precede content");
        match event {
            BackendEvent::Text(text) => {
                if text.is_empty() {
                    return None;
                }
                self.state.emitted_content = true;
                self.state.generated.push_str(&text);
                Some(self.chunk(
                    ChatDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                ))
            }
            BackendEvent::ToolCallStart { id, name } => {
                let index = self.state.tool_calls.len() as u32;
                self.state.tool_calls.insert(
                    index,
                    ToolCallEntry {
                        id: id.clone(),
                        name: name.clone(),
                    },
                );
                self.state.open_tool = Some(index);
                self.state.emitted_content = true;
                self.state.generated.push_str(&name);
                Some(self.tool_delta(ToolCallDelta {
                    index,
                    id: Some(id),
                    kind: Some("function".to_string()),
                    function: FunctionCallDelta {
                        name: Some(name),
                        arguments: String::new(),
                    },
                }))
            }
            BackendEvent::ToolArgumentDelta(fragment) => {
                let Some(index) = self.state.open_tool else {
                    debug!("argument fragment without an open tool call, dropped");
                    return None;
                };
                self.state.generated.push_str(&fragment);
                Some(self.tool_delta(ToolCallDelta {
                    index,
                    id: None,
                    kind: None,
                    function: FunctionCallDelta {
                        name: None,
                        arguments: fragment,
                    },
                }))
            }
            BackendEvent::Stop(reason) => {
                self.state.stop_reason = Some(reason);
                None
            }
            BackendEvent::Usage(reported) => {
                if reported.input_tokens > 0 {
                    self.state.reported_usage.input_tokens = reported.input_tokens;
                }
                if reported.output_tokens > 0 {
                    self.state.reported_usage.output_tokens = reported.output_tokens;
                }
                None
            }
        }
    }

    /// Closing frames: optional error frame, finish chunk, optional usage
    /// chunk, then `[DONE]`.
    ///
    /// An error is only reported in-band when nothing has been emitted yet;
    /// once content reached the client the stream closes as if it ended.
    pub fn finish(&mut self, failure: Option<&ProxyError>) -> Vec<SseFrame> {
        let mut frames = Vec::with_capacity(4);
        if let Some(err) = failure {
            if self.state.emitted_content {
                warn!(id = %self.id, error = %err, "backend failed mid-stream, closing normally");
            } else {
                warn!(id = %self.id, error = %err, "backend failed before any content");
                frames.push(SseFrame::Error(err.to_error_response()));
            }
        }

        let reason = self.finish_reason();
        frames.push(SseFrame::Chunk(self.chunk(ChatDelta::default(), Some(reason))));

        if self.include_usage {
            let usage = usage::resolve(
                Some(self.state.reported_usage),
                self.prompt_estimate,
                usage::estimate_tokens(&self.state.generated),
            );
            frames.push(SseFrame::Chunk(ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk",
                created: self.created,
                model: self.model.clone(),
                choices: Vec::new(),
                usage: Some(usage),
            }));
        }

        frames.push(SseFrame::Done);
        frames
    }

    fn finish_reason(&self) -> FinishReason {
        finish_reason(self.state.stop_reason)
    }

    fn tool_delta(&self, delta: ToolCallDelta) -> ChatCompletionChunk {
        self.chunk(
            ChatDelta {
                tool_calls: Some(vec![delta]),
                ..Default::default()
            },
            None,
        )
    }

    fn chunk(&self, delta: ChatDelta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }
}

/// Drive `events` through `translator`, producing encoded SSE frames.
///
/// `slot` is held until the stream is finished or dropped, so it is released
/// on completion, failure and client disconnect alike. The backend stream is
/// dropped before the closing frames are written.
pub fn relay<S>(
    mut translator: StreamTranslator,
    events: S,
    slot: AdmissionSlot,
) -> impl Stream<Item = Result<Bytes, actix_web::Error>>
where
    S: Stream<Item = Result<BackendEvent, ProxyError>> + Send + 'static,
{
    stream! {
        let mut slot = slot;
        let mut events = Box::pin(events);

        yield Ok(Bytes::from(SseFrame::Chunk(translator.role_chunk()).encode()));

        let mut failure = None;
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    if let Some(chunk) = translator.on_event(event) {
                        yield Ok(Bytes::from(SseFrame::Chunk(chunk).encode()));
                    }
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        drop(events);
        slot.release();

        for frame in translator.finish(failure.as_ref()) {
            yield Ok(Bytes::from(frame.encode()));
        }
    }
}
