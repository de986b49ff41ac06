//! Non-streaming response assembly.

use openbridge_protocol::anthropic::ContentBlock;
use openbridge_protocol::openai::{
    AssistantMessage, ChatChoice, ChatCompletionResponse, CompletionChoice, CompletionResponse,
    FunctionCall, ToolCall,
};

use super::{completion_id, finish_reason, unix_now, usage};
use crate::backend::BackendResult;

/// Build one `chat.completion` object from a completed backend result.
///
/// Text blocks are concatenated in order. `content` is `null` only when the
/// result holds tool calls and no text at all.
pub fn assemble_chat(
    result: BackendResult,
    model: &str,
    prompt_estimate: u32,
) -> ChatCompletionResponse {
    let completion_estimate = usage::estimate_completion_tokens(&result.content);

    let mut text: Option<String> = None;
    let mut tool_calls = Vec::new();
    for block in result.content {
        match block {
            ContentBlock::Text { text: part } => text.get_or_insert_with(String::new).push_str(&part),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: Some(id),
                kind: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } | ContentBlock::Unsupported => {}
        }
    }

    let content = match text {
        Some(text) => Some(text),
        None if !tool_calls.is_empty() => None,
        None => Some(String::new()),
    };

    ChatCompletionResponse {
        id: completion_id("chatcmpl"),
        object: "chat.completion",
        created: unix_now(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: finish_reason(result.stop_reason),
        }],
        usage: usage::resolve(result.usage, prompt_estimate, completion_estimate),
    }
}

/// Build a legacy `text_completion` object.
pub fn assemble_completion(
    result: BackendResult,
    model: &str,
    prompt_estimate: u32,
) -> CompletionResponse {
    let completion_estimate = usage::estimate_completion_tokens(&result.content);
    let text: String = result
        .content
        .iter()
        .filter_map(ContentBlock::as_text)
        .collect();

    CompletionResponse {
        id: completion_id("cmpl"),
        object: "text_completion",
        created: unix_now(),
        model: model.to_string(),
        choices: vec![CompletionChoice {
            text,
            index: 0,
            logprobs: None,
            finish_reason: finish_reason(result.stop_reason),
        }],
        usage: usage::resolve(result.usage, prompt_estimate, completion_estimate),
    }
}
