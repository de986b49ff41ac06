//! OpenBridge - OpenAI-compatible HTTP proxy for Anthropic-style backends.
//!
//! Any OpenAI SDK client can talk to this server. Each request is translated
//! into the native Messages format and executed by one of two backends:
//! - `api`: a direct HTTPS call to the Messages API (SSE streaming).
//! - `cli`: the local `claude` agent binary, run once per request.
//!
//! Results, including token-by-token streams, are translated back into
//! `chat.completion` objects and `chat.completion.chunk` SSE frames.
//!
//! Concurrency is capped by an [`admission::AdmissionController`] that
//! rejects instead of queueing.

pub mod admission;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod error;
pub mod server;
pub mod translate;

pub use config::{BackendKind, ProxyConfig};
pub use error::ProxyError;
pub use server::{configure, serve, AppState};
