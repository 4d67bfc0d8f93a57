use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::types::{GenerateRequest, GenerateResponse};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> &str;
    fn model_id(&self) -> &str;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;
}

/// Resolves a model name to a callable model.
///
/// An empty name selects the provider's default model.
pub trait ModelProvider: Send + Sync {
    fn resolve(&self, model_name: &str) -> Result<Arc<dyn LanguageModel>>;
}

#[async_trait]
impl<M> LanguageModel for Arc<M>
where
    M: LanguageModel + ?Sized,
{
    fn provider(&self) -> &str {
        (**self).provider()
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        (**self).generate(request).await
    }
}
