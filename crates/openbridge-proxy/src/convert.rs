//! OpenAI chat request -> native request conversion.
//!
//! The native API wants the system prompt out of band, a conversation that
//! opens with the user and strictly alternates roles, and tool traffic as
//! typed content blocks instead of role metadata. Conversion never fails on
//! content shape: malformed tool arguments degrade to `{}`, unknown image
//! forms are dropped, adjacent same-role messages are merged.

use openbridge_protocol::anthropic::{
    ContentBlock, ImageSource, MessagesRequest, NativeMessage, Role, Tool,
    ToolChoice as NativeToolChoice,
};
use openbridge_protocol::openai::{
    ChatCompletionRequest, ChatMessage, CompletionRequest, ContentPart, MessageContent, ToolCall,
    ToolChoice, ToolChoiceMode, ToolDefinition,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ProxyError;

/// Text of the synthetic opener inserted when a conversation starts with the assistant.
pub const PLACEHOLDER_USER_TEXT: &str = "(conversation start)";

/// Backend-neutral result of converting an OpenAI message list.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub system: Option<String>,
    pub messages: Vec<NativeMessage>,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<NativeToolChoice>,
}

/// Convert messages, tool definitions and tool choice into native form.
pub fn convert(
    messages: &[ChatMessage],
    tools: Option<&[ToolDefinition]>,
    tool_choice: Option<&ToolChoice>,
) -> Conversation {
    let mut system_parts: Vec<String> = Vec::new();
    let mut out: Vec<NativeMessage> = Vec::new();

    for msg in messages {
        match msg {
            ChatMessage::System { content } => {
                let text = content.joined_text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            ChatMessage::User { content } => {
                push_merged(&mut out, Role::User, content_blocks(content));
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut blocks = content.as_ref().map(content_blocks).unwrap_or_default();
                blocks.extend(tool_calls.iter().map(tool_use_block));
                push_merged(&mut out, Role::Assistant, blocks);
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: tool_result_text(content),
                    is_error: None,
                };
                push_merged(&mut out, Role::User, vec![block]);
            }
        }
    }

    if out.first().map(|m| m.role) != Some(Role::User) {
        out.insert(0, NativeMessage::user_text(PLACEHOLDER_USER_TEXT));
    }

    let tools: Vec<Tool> = tools.unwrap_or_default().iter().map(convert_tool).collect();
    // The native API rejects a tool choice without tools.
    let tool_choice = if tools.is_empty() {
        None
    } else {
        tool_choice.map(convert_tool_choice)
    };

    Conversation {
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
        messages: out,
        tools,
        tool_choice,
    }
}

/// Append blocks, merging into the previous message when the role repeats.
fn push_merged(out: &mut Vec<NativeMessage>, role: Role, blocks: Vec<ContentBlock>) {
    if blocks.is_empty() {
        return;
    }
    match out.last_mut() {
        Some(last) if last.role == role => last.content.extend(blocks),
        _ => out.push(NativeMessage::new(role, blocks)),
    }
}

fn content_blocks(content: &MessageContent) -> Vec<ContentBlock> {
    match content {
        MessageContent::Text(text) if text.is_empty() => Vec::new(),
        MessageContent::Text(text) => vec![ContentBlock::text(text.clone())],
        MessageContent::Parts(parts) => parts.iter().filter_map(part_block).collect(),
    }
}

fn part_block(part: &ContentPart) -> Option<ContentBlock> {
    match part {
        ContentPart::Text { text } if text.is_empty() => None,
        ContentPart::Text { text } => Some(ContentBlock::text(text.clone())),
        ContentPart::ImageUrl { image_url } => {
            parse_image(image_url.url()).map(|source| ContentBlock::Image { source })
        }
        ContentPart::Unsupported => None,
    }
}

/// Recognize `data:<media>;base64,<payload>` and http(s) URLs.
pub fn parse_image(url: &str) -> Option<ImageSource> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (media_type, data) = rest.split_once(";base64,")?;
        if media_type.is_empty() || data.is_empty() {
            return None;
        }
        return Some(ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        });
    }
    if url.starts_with("https://") || url.starts_with("http://") {
        return Some(ImageSource::Url {
            url: url.to_string(),
        });
    }
    None
}

fn tool_use_block(call: &ToolCall) -> ContentBlock {
    let id = call
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generate_tool_call_id);
    ContentBlock::ToolUse {
        id,
        name: call.function.name.clone(),
        input: parse_arguments(&call.function.arguments),
    }
}

/// Parse a tool-call argument string; anything but a JSON object becomes `{}`.
pub fn parse_arguments(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({}),
    }
}

pub fn generate_tool_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Strings pass through, text-part arrays are joined, anything else is JSON-encoded.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => {
            let texts: Option<Vec<&str>> = items
                .iter()
                .map(|item| match item.get("type").and_then(Value::as_str) {
                    Some("text") => item.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            match texts {
                Some(texts) => texts.concat(),
                None => content.to_string(),
            }
        }
        other => other.to_string(),
    }
}

fn convert_tool(tool: &ToolDefinition) -> Tool {
    Tool {
        name: tool.function.name.clone(),
        description: tool.function.description.clone().unwrap_or_default(),
        input_schema: tool
            .function
            .parameters
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    }
}

pub fn convert_tool_choice(choice: &ToolChoice) -> NativeToolChoice {
    match choice {
        ToolChoice::Mode(ToolChoiceMode::Auto) => NativeToolChoice::Auto,
        ToolChoice::Mode(ToolChoiceMode::None) => NativeToolChoice::None,
        ToolChoice::Mode(ToolChoiceMode::Required) => NativeToolChoice::Any,
        ToolChoice::Named(named) => NativeToolChoice::Tool {
            name: named.function.name.clone(),
        },
    }
}

/// Reject requests that must never reach a backend.
pub fn validate_chat_request(req: &ChatCompletionRequest) -> Result<(), ProxyError> {
    if req.model.trim().is_empty() {
        return Err(ProxyError::InvalidRequest("'model' is required".to_string()));
    }
    if !req.messages.iter().any(|m| !m.is_system()) {
        return Err(ProxyError::InvalidRequest(
            "'messages' must contain at least one non-system message".to_string(),
        ));
    }
    if req.output_limit() == Some(0) {
        return Err(ProxyError::InvalidRequest(
            "'max_tokens' must be greater than 0".to_string(),
        ));
    }
    if let Some(tools) = &req.tools {
        if tools.iter().any(|t| t.function.name.trim().is_empty()) {
            return Err(ProxyError::InvalidRequest(
                "every tool needs a non-empty function name".to_string(),
            ));
        }
    }
    for msg in &req.messages {
        if let ChatMessage::Tool { tool_call_id, .. } = msg {
            if tool_call_id.is_empty() {
                return Err(ProxyError::InvalidRequest(
                    "tool message is missing 'tool_call_id'".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Validate and convert a chat request for the resolved backend model.
pub fn build_native_request(
    req: &ChatCompletionRequest,
    model: &str,
    default_max_tokens: u32,
) -> Result<MessagesRequest, ProxyError> {
    validate_chat_request(req)?;
    let conversation = convert(&req.messages, req.tools.as_deref(), req.tool_choice.as_ref());

    Ok(MessagesRequest {
        model: model.to_string(),
        max_tokens: req.output_limit().unwrap_or(default_max_tokens),
        messages: conversation.messages,
        system: conversation.system,
        tools: conversation.tools,
        tool_choice: conversation.tool_choice,
        stream: false,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop.clone().map(|s| s.into_vec()).unwrap_or_default(),
    })
}

/// Legacy single-prompt form: the prompt becomes one user message.
pub fn build_legacy_request(
    req: &CompletionRequest,
    model: &str,
    default_max_tokens: u32,
) -> Result<MessagesRequest, ProxyError> {
    if req.model.trim().is_empty() {
        return Err(ProxyError::InvalidRequest("'model' is required".to_string()));
    }
    if req.stream {
        return Err(ProxyError::InvalidRequest(
            "streaming is not supported on /v1/completions, use /v1/chat/completions".to_string(),
        ));
    }
    let prompt = req.prompt.joined();
    if prompt.trim().is_empty() {
        return Err(ProxyError::InvalidRequest("'prompt' must not be empty".to_string()));
    }
    if req.max_tokens == Some(0) {
        return Err(ProxyError::InvalidRequest(
            "'max_tokens' must be greater than 0".to_string(),
        ));
    }

    Ok(MessagesRequest {
        model: model.to_string(),
        max_tokens: req.max_tokens.unwrap_or(default_max_tokens),
        messages: vec![NativeMessage::user_text(prompt)],
        system: None,
        tools: Vec::new(),
        tool_choice: None,
        stream: false,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop.clone().map(|s| s.into_vec()).unwrap_or_default(),
    })
}
