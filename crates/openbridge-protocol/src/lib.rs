//! openbridge protocol - wire types for both sides of the bridge
//!
//! - [`openai`]: the inbound OpenAI-compatible surface (chat completions,
//!   legacy completions, models, error envelope).
//! - [`anthropic`]: the native `/v1/messages` schema spoken by the remote API
//!   and embedded in the local agent's line-delimited output.

pub mod anthropic;
pub mod openai;
