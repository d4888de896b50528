//! Model-provider streaming interface.
//!
//! Concrete vendor protocols live outside this crate; they implement
//! [`LlmProvider`] and translate their wire events into [`StreamChunk`]s.

pub mod streaming;
pub mod types;

pub use streaming::{StreamBox, StreamChunk, ToolCallAccumulator, ToolCallRequest};
pub use types::{StopReason, StreamRequest, ToolDefinition};

use crate::error::ProviderError;
use async_trait::async_trait;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Open a streaming completion.
    ///
    /// # Errors
    /// Fails with a classified [`ProviderError`] when the request cannot be
    /// started; errors after the first chunk arrive through the stream.
    async fn stream(&self, request: StreamRequest) -> Result<StreamBox, ProviderError>;

    fn model(&self) -> &str;

    fn provider(&self) -> &'static str;
}
