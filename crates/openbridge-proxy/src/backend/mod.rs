//! Execution backends.
//!
//! A [`Backend`] turns one native request into either a completed result or a
//! pull-based stream of [`BackendEvent`]s. Two implementations exist:
//! [`ApiBackend`] calls the remote API over HTTPS, [`CliBackend`] runs the
//! local agent binary. The server picks one at startup and shares it behind an
//! `Arc<dyn Backend>`.

mod api;
mod cli;
mod events;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use openbridge_protocol::anthropic::{ContentBlock, MessagesRequest, StopReason, Usage};

use crate::config::{BackendKind, ProxyConfig};
use crate::error::ProxyError;

pub use api::{AuthMode, ApiBackend};
pub use cli::{render_prompt, CliBackend};
pub use events::decode_stream_event;

/// One incremental event from a streaming execution.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A text increment, relayed verbatim.
    Text(String),
    /// A new tool invocation begins.
    ToolCallStart { id: String, name: String },
    /// A fragment of the currently open tool invocation's JSON arguments.
    ToolArgumentDelta(String),
    /// Forward-looking terminal reason; may arrive before the stream ends.
    Stop(StopReason),
    /// Token counts reported mid-stream; zero fields mean "not reported".
    Usage(Usage),
}

/// Result of a non-streaming execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendResult {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<StopReason>,
    /// `None` when the backend did not report counts.
    pub usage: Option<Usage>,
}

/// Finite, single-pass event source for one request.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, ProxyError>> + Send>>;

pub enum Execution {
    Completed(BackendResult),
    Streaming(EventStream),
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Execution::Completed(result) => f.debug_tuple("Completed").field(result).finish(),
            Execution::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run one request. With `streaming`, errors that happen before the first
    /// event is produced may also surface as the stream's first item.
    async fn execute(
        &self,
        request: MessagesRequest,
        streaming: bool,
    ) -> Result<Execution, ProxyError>;
}

/// Build the backend selected by configuration.
pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Api => Arc::new(ApiBackend::new(config)?),
        BackendKind::Cli => Arc::new(CliBackend::new(config)),
    };
    Ok(backend)
}
