//! LLM provider trait and retry policy

use crate::types::{LlmRequest, StreamDelta};
use capstan_core::ProviderError;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub type LlmResult<T> = Result<T, ProviderError>;

/// Stream type for LLM responses
pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<StreamDelta>> + Send>>;

/// A provider dialect adapter. Implementations translate their wire format
/// into the `StreamDelta` union.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn models(&self) -> &[&str];

    fn supports_model(&self, model: &str) -> bool {
        self.models()
            .iter()
            .any(|m| *m == model || model.starts_with(m))
    }

    /// Stream a completion. If `cancel` is provided and triggered, the
    /// underlying connection is dropped and the stream ends.
    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream>;
}

const RETRY_BASE: Duration = Duration::from_millis(500);
const MAX_ATTEMPTS: u32 = 3;

/// Open a completion stream, retrying recoverable failures (transport,
/// rate limit) with exponential backoff. Non-recoverable errors are
/// returned immediately.
pub async fn complete_stream_with_retry(
    provider: &dyn LlmProvider,
    request: LlmRequest,
    cancel: Option<CancellationToken>,
) -> LlmResult<LlmStream> {
    let mut attempt = 0u32;
    loop {
        match provider.complete_stream(request.clone(), cancel.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_recoverable() && attempt + 1 < MAX_ATTEMPTS => {
                let delay = match &e {
                    ProviderError::RateLimited { retry_after_ms } => {
                        Duration::from_millis(*retry_after_ms)
                    }
                    _ => RETRY_BASE * 2u32.pow(attempt),
                };
                warn!(
                    provider = provider.name(),
                    attempt, "recoverable provider error, retrying in {:?}: {}", delay, e
                );
                attempt += 1;
                if let Some(ref token) = cancel {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            return Err(ProviderError::Transport("cancelled".into()));
                        }
                    }
                } else {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
