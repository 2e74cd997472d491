//! Gateway to the stateful conversation backend.

pub mod error;
pub mod stateful;
pub mod stream;
pub mod types;
pub mod usage;

use std::sync::Arc;

use stateful::ChatProvider;
use usage::UsageRecord;

pub use error::{ErrorContext, ProviderError, StatusKind};
pub use stateful::StatefulChatAdapter;
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

/// One attempt against the backend. Retrying is the caller's decision.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Adapter plus usage accounting.
pub struct ProviderGateway<U: UsageSink> {
    adapter: StatefulChatAdapter,
    usage_sink: Arc<U>,
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn new(adapter: StatefulChatAdapter, usage_sink: Arc<U>) -> Self {
        Self {
            adapter,
            usage_sink,
        }
    }

    pub fn adapter(&self) -> &StatefulChatAdapter {
        &self.adapter
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let result = self.adapter.chat(&req).await;
        self.usage_sink
            .record(UsageRecord::for_attempt(&req, result.as_ref()))
            .await;
        result
    }
}
