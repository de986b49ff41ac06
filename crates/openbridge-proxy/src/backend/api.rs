//! Direct-call backend: the remote Messages API over HTTPS.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use openbridge_protocol::anthropic::{MessagesRequest, MessagesResponse, StreamEvent};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use super::{decode_stream_event, Backend, BackendResult, EventStream, Execution};
use crate::config::{BackendKind, ProxyConfig};
use crate::error::ProxyError;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const BETA_OAUTH: &str = "oauth-2025-04-20";
const BETA_INTERLEAVED_THINKING: &str = "interleaved-thinking-2025-05-14";

/// Subscription tokens carry this prefix; plain API keys do not.
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";

/// First line of the system prompt required for subscription-token requests.
const AGENT_IDENTITY: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
const AGENT_USER_AGENT: &str = "claude-cli/1.0.0 (external, cli)";

/// Authentication header set, selected by the credential's shape.
#[derive(Debug)]
pub enum AuthMode {
    /// `x-api-key: <key>`
    ApiKey(SecretString),
    /// Bearer token plus the first-party agent header set.
    OAuth(SecretString),
}

impl AuthMode {
    pub fn from_token(token: &str) -> Self {
        let secret = SecretString::from(token.to_string());
        if token.starts_with(OAUTH_TOKEN_PREFIX) {
            AuthMode::OAuth(secret)
        } else {
            AuthMode::ApiKey(secret)
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self, AuthMode::OAuth(_))
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            AuthMode::ApiKey(key) => request.header("x-api-key", key.expose_secret()),
            AuthMode::OAuth(token) => request
                .bearer_auth(token.expose_secret())
                .header(
                    "anthropic-beta",
                    format!("{BETA_OAUTH},{BETA_INTERLEAVED_THINKING}"),
                )
                .header("x-app", "cli")
                .header(reqwest::header::USER_AGENT, AGENT_USER_AGENT),
        }
    }
}

pub struct ApiBackend {
    client: Client,
    base_url: String,
    auth: Option<AuthMode>,
    timeout_secs: u64,
}

impl ApiBackend {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url_trimmed().to_string(),
            auth: config
                .api_key
                .as_ref()
                .map(|key| AuthMode::from_token(key.expose_secret())),
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> ProxyError {
        if err.is_timeout() {
            ProxyError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ProxyError::backend("API request failed", &err.to_string())
        }
    }
}

#[async_trait]
impl Backend for ApiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    async fn execute(
        &self,
        mut request: MessagesRequest,
        streaming: bool,
    ) -> Result<Execution, ProxyError> {
        let auth = self.auth.as_ref().ok_or_else(|| {
            ProxyError::MissingCredential(
                "set ANTHROPIC_API_KEY or CLAUDE_CODE_OAUTH_TOKEN".to_string(),
            )
        })?;

        if auth.is_oauth() {
            request.system = Some(with_identity(request.system.take()));
        }
        request.stream = streaming;

        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %request.model, streaming, "calling messages API");

        let response = auth
            .apply(self.client.post(&url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "messages API returned an error");
            return Err(ProxyError::backend(format!("API error {status}"), &body));
        }

        if streaming {
            return Ok(Execution::Streaming(event_stream(response)));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::backend("unreadable API response", &e.to_string()))?;
        Ok(Execution::Completed(BackendResult {
            content: body.content,
            stop_reason: body.stop_reason,
            usage: body.usage,
        }))
    }
}

fn with_identity(system: Option<String>) -> String {
    match system {
        Some(system) if !system.trim().is_empty() => format!("{AGENT_IDENTITY}\n\n{system}"),
        _ => AGENT_IDENTITY.to_string(),
    }
}

/// Decode the response body as server-sent events. Records that are not
/// valid stream events are skipped.
fn event_stream(response: Response) -> EventStream {
    Box::pin(stream! {
        let mut records = response.bytes_stream().eventsource();
        while let Some(record) = records.next().await {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    yield Err(ProxyError::backend("API stream interrupted", &err.to_string()));
                    return;
                }
            };
            if record.data.trim().is_empty() {
                continue;
            }
            let event: StreamEvent = match serde_json::from_str(&record.data) {
                Ok(event) => event,
                Err(err) => {
                    debug!(error = %err, event = %record.event, "skipping unparseable stream record");
                    continue;
                }
            };
            match decode_stream_event(event) {
                Ok(decoded) => {
                    for item in decoded {
                        yield Ok(item);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendEvent;
    use openbridge_protocol::anthropic::{ContentBlock, NativeMessage, StopReason};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer, token: Option<&str>) -> ApiBackend {
        let config = ProxyConfig {
            base_url: server.uri(),
            api_key: token.map(|t| SecretString::from(t.to_string())),
            ..Default::default()
        };
        ApiBackend::new(&config).unwrap()
    }

    fn request() -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 64,
            messages: vec![NativeMessage::user_text("hi")],
            system: Some("Be brief.".to_string()),
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
        }
    }

    fn completed(execution: Execution) -> BackendResult {
        match execution {
            Execution::Completed(result) => result,
            Execution::Streaming(_) => panic!("expected a completed result"),
        }
    }

    #[test]
    fn token_shape_selects_auth_mode() {
        assert!(AuthMode::from_token("sk-ant-oat01-abc").is_oauth());
        assert!(!AuthMode::from_token("sk-ant-api03-abc").is_oauth());
    }

    #[tokio::test]
    async fn plain_key_uses_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-api03-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({"system": "Be brief."})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-sonnet-4-5",
                "content": [{"type": "text", "text": "Hello!"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 9, "output_tokens": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = completed(
            backend(&server, Some("sk-ant-api03-test"))
                .execute(request(), false)
                .await
                .unwrap(),
        );
        assert_eq!(result.content, vec![ContentBlock::text("Hello!")]);
        assert_eq!(result.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(result.usage.unwrap().output_tokens, 3);
    }

    #[tokio::test]
    async fn oauth_token_uses_bearer_headers_and_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("authorization", "Bearer sk-ant-oat01-test"))
            .and(header("x-app", "cli"))
            .and(body_partial_json(json!({
                "system": format!("{AGENT_IDENTITY}\n\nBe brief.")
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_2",
                "content": [{"type": "text", "text": "ok"}],
                "stop_reason": "end_turn"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = completed(
            backend(&server, Some("sk-ant-oat01-test"))
                .execute(request(), false)
                .await
                .unwrap(),
        );
        assert!(result.usage.is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_a_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(529).set_body_string(r#"{"error":"overloaded"}"#),
            )
            .mount(&server)
            .await;

        let err = backend(&server, Some("sk-ant-api03-test"))
            .execute(request(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Backend(_)));
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = backend(&server, None)
            .execute(request(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::MissingCredential(_)));
    }

    #[tokio::test]
    async fn streaming_body_decodes_into_events() {
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_3\",\"model\":\"m\",\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n",
            "event: ping\n",
            "data: {\"type\":\"ping\"}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_9\",\"name\":\"lookup\",\"input\":{}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"q\\\": 1}\"}}\n\n",
            "data: not json at all\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":12}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let execution = backend(&server, Some("sk-ant-api03-test"))
            .execute(request(), true)
            .await
            .unwrap();
        let Execution::Streaming(stream) = execution else {
            panic!("expected a stream");
        };
        let events: Vec<BackendEvent> = stream.map(|e| e.unwrap()).collect().await;

        assert_eq!(events.len(), 5);
        assert!(matches!(&events[1], BackendEvent::ToolCallStart { id, .. } if id == "toolu_9"));
        assert_eq!(
            events[2],
            BackendEvent::ToolArgumentDelta("{\"q\": 1}".to_string())
        );
        assert_eq!(events[3], BackendEvent::Stop(StopReason::ToolUse));
    }
}
