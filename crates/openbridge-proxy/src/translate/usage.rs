//! Token accounting.
//!
//! Backend-reported counts are used whenever they are present. The process
//! backend and the plain-text fallback report nothing, so a coarse estimate
//! fills the gap: the larger of one token per four characters and one token
//! per whitespace-separated word. It is an approximation, not a tokenizer
//! count.

use openbridge_protocol::anthropic::{ContentBlock, MessagesRequest, Usage as NativeUsage};
use openbridge_protocol::openai::Usage;

pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    let words = text.split_whitespace().count();
    let estimate = chars.div_ceil(4).max(words);
    u32::try_from(estimate).unwrap_or(u32::MAX)
}

/// Estimate for everything sent to the backend: system text, messages and
/// tool definitions.
pub fn estimate_prompt_tokens(request: &MessagesRequest) -> u32 {
    let mut total = request.system.as_deref().map_or(0, estimate_tokens);
    for message in &request.messages {
        total = total.saturating_add(estimate_completion_tokens(&message.content));
    }
    for tool in &request.tools {
        total = total
            .saturating_add(estimate_tokens(&tool.name))
            .saturating_add(estimate_tokens(&tool.description))
            .saturating_add(estimate_tokens(&tool.input_schema.to_string()));
    }
    total
}

pub fn estimate_completion_tokens(blocks: &[ContentBlock]) -> u32 {
    blocks
        .iter()
        .map(|block| estimate_tokens(&block.to_plaintext()))
        .fold(0, u32::saturating_add)
}

/// Combine reported counts with estimates. A zero count means "not reported".
pub fn resolve(reported: Option<NativeUsage>, prompt_estimate: u32, completion_estimate: u32) -> Usage {
    let reported = reported.unwrap_or_default();
    let prompt = if reported.input_tokens > 0 {
        reported.input_tokens
    } else {
        prompt_estimate
    };
    let completion = if reported.output_tokens > 0 {
        reported.output_tokens
    } else {
        completion_estimate
    };
    Usage::new(prompt, completion)
}
