use crate::types::{LlmRequest, StreamDelta};
use futures::Stream;
use std::pin::Pin;

#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    #[error("auth failed: {0}")]
    AuthFailed(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("stream error: {0}")]
    StreamError(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type LlmResult<T> = Result<T, LlmError>;
pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<StreamDelta>> + Send>>;

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn models(&self) -> &[&str];
    async fn complete_stream(&self, request: LlmRequest) -> LlmResult<LlmStream>;
}
