//! Actix Web HTTP server.
//!
//! Exposes OpenAI-compatible endpoints:
//! - `POST /v1/chat/completions`
//! - `POST /v1/completions`
//! - `GET /v1/models`, `GET /v1/models/{id}`
//! - `GET /health`
//!
//! Unknown routes answer 404 with the OpenAI error envelope.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use openbridge_protocol::openai::{ChatCompletionRequest, CompletionRequest};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, AdmissionSlot};
use crate::backend::{self, Backend, EventStream, Execution};
use crate::catalog::ModelCatalog;
use crate::config::{BackendKind, ProxyConfig};
use crate::convert::{build_legacy_request, build_native_request};
use crate::error::ProxyError;
use crate::translate::{self, usage, StreamTranslator};

/// Request bodies may carry inline images.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub admission: AdmissionController,
    pub catalog: Arc<ModelCatalog>,
    pub default_max_tokens: u32,
}

impl AppState {
    pub fn new(config: &ProxyConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            admission: AdmissionController::new(config.max_concurrent),
            catalog: Arc::new(ModelCatalog::new(&config.model_aliases)),
            default_max_tokens: config.default_max_tokens,
        }
    }

    fn resolve_model(&self, requested: &str) -> String {
        self.catalog.resolve(requested.trim()).to_string()
    }

    fn admit(&self) -> Result<AdmissionSlot, ProxyError> {
        self.admission
            .try_acquire()
            .ok_or(ProxyError::CapacityExceeded {
                capacity: self.admission.capacity(),
            })
    }
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    let addr = config.bind_addr();
    if config.backend == BackendKind::Api && config.api_key.is_none() {
        warn!("no backend credential configured, chat requests will fail with 500");
    }

    let backend = backend::from_config(&config).context("failed to build backend")?;
    let state = web::Data::new(AppState::new(&config, backend));
    info!(
        addr = %addr,
        backend = %config.backend,
        max_concurrent = config.max_concurrent,
        "openbridge listening"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Cors::permissive())
            .configure(configure)
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {}", addr))?
    .run()
    .await
    .context("server error")?;

    Ok(())
}

/// Routes, body limits and the JSON 404 fallback.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .route("/health", web::get().to(health_check))
        .route("/v1/chat/completions", web::post().to(chat_completions))
        .route("/v1/completions", web::post().to(completions))
        .route("/v1/models", web::get().to(list_models))
        .route("/v1/models/{id}", web::get().to(get_model))
        .default_service(web::to(not_found));
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "backend": state.backend.kind().to_string(),
        "in_flight": state.admission.in_flight(),
        "capacity": state.admission.capacity(),
    }))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid request body: {e}")))
}

async fn chat_completions(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ProxyError> {
    let req: ChatCompletionRequest = parse_body(&body)?;
    let model = state.resolve_model(&req.model);
    let native = build_native_request(&req, &model, state.default_max_tokens)?;
    let prompt_estimate = usage::estimate_prompt_tokens(&native);

    let slot = state.admit()?;
    info!(
        model = %model,
        requested = %req.model,
        streaming = req.stream,
        tools = native.tools.len(),
        "chat completion"
    );

    match state.backend.execute(native, req.stream).await? {
        Execution::Streaming(events) => {
            let translator = StreamTranslator::new(&req.model, req.include_usage(), prompt_estimate);
            stream_response(events, translator, slot).await
        }
        Execution::Completed(result) => {
            drop(slot);
            Ok(HttpResponse::Ok().json(translate::assemble_chat(
                result,
                &req.model,
                prompt_estimate,
            )))
        }
    }
}

/// Commit the event-stream response only once the backend produced its
/// first event, so early failures still get a proper HTTP status.
async fn stream_response(
    mut events: EventStream,
    translator: StreamTranslator,
    slot: AdmissionSlot,
) -> Result<HttpResponse, ProxyError> {
    let first = match events.next().await {
        Some(Err(err)) => return Err(err),
        first => first,
    };
    debug!(id = %translator.id(), "streaming response committed");

    let events = stream::iter(first).chain(events);
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(translate::relay(translator, events, slot)))
}

async fn completions(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ProxyError> {
    let req: CompletionRequest = parse_body(&body)?;
    let model = state.resolve_model(&req.model);
    let native = build_legacy_request(&req, &model, state.default_max_tokens)?;
    let prompt_estimate = usage::estimate_prompt_tokens(&native);

    let _slot = state.admit()?;
    info!(model = %model, requested = %req.model, "text completion");

    match state.backend.execute(native, false).await? {
        Execution::Completed(result) => Ok(HttpResponse::Ok().json(
            translate::assemble_completion(result, &req.model, prompt_estimate),
        )),
        Execution::Streaming(_) => Err(ProxyError::Internal(
            "backend streamed a non-streaming request".to_string(),
        )),
    }
}

async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.catalog.list())
}

async fn get_model(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, ProxyError> {
    let id = id.into_inner();
    state
        .catalog
        .get(&id)
        .map(|model| HttpResponse::Ok().json(model))
        .ok_or_else(|| ProxyError::NotFound(format!("model '{id}' does not exist")))
}

async fn not_found(req: HttpRequest) -> Result<HttpResponse, ProxyError> {
    Err(ProxyError::NotFound(format!(
        "unknown route: {} {}",
        req.method(),
        req.path()
    )))
}
