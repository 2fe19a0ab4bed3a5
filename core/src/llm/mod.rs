//! LLM module
//!
//! Multi-provider chat completion used by bots.

pub mod chat;
pub mod client;

pub use chat::{ChatMessage, ChatRequest, ChatResponse, MessageRole, Usage};
pub use client::{shared_rate_limiter, LlmClient, LlmConfig};

use async_trait::async_trait;

use crate::error::Result;

/// Anything a bot can talk to
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    fn model_name(&self) -> &str;
}
