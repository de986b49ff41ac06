//! Backend results back into the OpenAI wire format.

pub mod response;
pub mod stream;
pub mod usage;

use openbridge_protocol::anthropic::StopReason;
use openbridge_protocol::openai::FinishReason;
use uuid::Uuid;

pub use response::{assemble_chat, assemble_completion};
pub use stream::{relay, SseFrame, StreamTranslator};

/// Map a backend stop reason onto the three OpenAI finish reasons.
pub fn finish_reason(stop: Option<StopReason>) -> FinishReason {
    match stop {
        Some(StopReason::ToolUse) => FinishReason::ToolCalls,
        Some(StopReason::MaxTokens) => FinishReason::Length,
        Some(
            StopReason::EndTurn
            | StopReason::StopSequence
            | StopReason::PauseTurn
            | StopReason::Refusal
            | StopReason::Unknown,
        )
        | None => FinishReason::Stop,
    }
}

pub(crate) fn completion_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_mapping_is_total() {
        let cases = [
            (Some(StopReason::EndTurn), FinishReason::Stop),
            (Some(StopReason::MaxTokens), FinishReason::Length),
            (Some(StopReason::StopSequence), FinishReason::Stop),
            (Some(StopReason::ToolUse), FinishReason::ToolCalls),
            (Some(StopReason::PauseTurn), FinishReason::Stop),
            (Some(StopReason::Refusal), FinishReason::Stop),
            (Some(StopReason::Unknown), FinishReason::Stop),
            (None, FinishReason::Stop),
        ];
        for (stop, expected) in cases {
            assert_eq!(finish_reason(stop), expected, "{stop:?}");
        }
    }

    #[test]
    fn unrecognized_wire_value_defaults_to_stop() {
        let stop: StopReason = serde_json::from_str("\"model_context_window_exceeded\"").unwrap();
        assert_eq!(finish_reason(Some(stop)), FinishReason::Stop);
    }

    #[test]
    fn ids_carry_prefix() {
        let id = completion_id("chatcmpl");
        assert!(id.starts_with("chatcmpl-"));
        assert_ne!(id, completion_id("chatcmpl"));
    }
}
