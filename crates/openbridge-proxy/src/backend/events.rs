//! Native stream event -> [`BackendEvent`] decoding, shared by both backends.

use openbridge_protocol::anthropic::{BlockDelta, ContentBlock, StreamEvent};

use super::BackendEvent;
use crate::error::ProxyError;

/// Decode one native stream event. Events with nothing to relay yield an
/// empty list; an upstream `error` event fails the stream.
pub fn decode_stream_event(event: StreamEvent) -> Result<Vec<BackendEvent>, ProxyError> {
    let decoded = match event {
        StreamEvent::MessageStart { message } => {
            message.usage.map(BackendEvent::Usage).into_iter().collect()
        }
        StreamEvent::ContentBlockStart { content_block, .. } => match content_block {
            ContentBlock::Text { text } if !text.is_empty() => vec![BackendEvent::Text(text)],
            ContentBlock::ToolUse { id, name, .. } => {
                vec![BackendEvent::ToolCallStart { id, name }]
            }
            _ => Vec::new(),
        },
        StreamEvent::ContentBlockDelta { delta, .. } => match delta {
            BlockDelta::TextDelta { text } if !text.is_empty() => vec![BackendEvent::Text(text)],
            BlockDelta::InputJsonDelta { partial_json } if !partial_json.is_empty() => {
                vec![BackendEvent::ToolArgumentDelta(partial_json)]
            }
            _ => Vec::new(),
        },
        StreamEvent::MessageDelta { delta, usage } => delta
            .stop_reason
            .map(BackendEvent::Stop)
            .into_iter()
            .chain(usage.map(BackendEvent::Usage))
            .collect(),
        StreamEvent::Error { error } => {
            return Err(ProxyError::Backend(format!(
                "stream error ({}): {}",
                error.r#type, error.message
            )));
        }
        StreamEvent::ContentBlockStop { .. } | StreamEvent::MessageStop | StreamEvent::Ping => {
            Vec::new()
        }
    };
    Ok(decoded)
}
