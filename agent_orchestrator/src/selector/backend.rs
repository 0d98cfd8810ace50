//! Uniform completion interface consumed by the selector.
//!
//! Concrete providers live outside this crate; only a local `echo` backend is
//! built in so the orchestrator can run end-to-end without network access.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::error::OrchestratorError;
use crate::settings::BackendConfig;

#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.2,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Actual cost if the provider reports one; the estimate is charged otherwise.
    pub cost: Option<f64>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cost: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompletionError {
    #[error("completion timed out")]
    Timeout,
    #[error("rate limited by provider")]
    RateLimited,
    #[error("provider failure: {0}")]
    ProviderError(String),
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn id(&self) -> &str;
    async fn complete(
        &self,
        prompt: &str,
        params: &CompletionParams,
    ) -> Result<Completion, CompletionError>;
}

/// Local development backend that answers with the tail of the prompt.
pub struct EchoBackend {
    id: String,
}

impl EchoBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl CompletionBackend for EchoBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        prompt: &str,
        params: &CompletionParams,
    ) -> Result<Completion, CompletionError> {
        let last_line = prompt.lines().last().unwrap_or_default();
        let mut text = format!("[{}] {}", self.id, last_line);
        if text.len() > params.max_tokens * 4 {
            let mut cut = params.max_tokens * 4;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        debug!("Echo backend '{}' produced {} bytes", self.id, text.len());
        Ok(Completion::text(text))
    }
}

/// Build the backends named in configuration.
pub fn build_backends(
    configs: &[BackendConfig],
) -> Result<HashMap<String, Arc<dyn CompletionBackend>>, OrchestratorError> {
    let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
    for cfg in configs {
        let backend: Arc<dyn CompletionBackend> = match cfg.provider.as_str() {
            "echo" => Arc::new(EchoBackend::new(cfg.id.clone())),
            other => {
                return Err(OrchestratorError::Config(format!(
                    "backend '{}' uses provider '{}' which must be injected programmatically",
                    cfg.id, other
                )))
            }
        };
        backends.insert(cfg.id.clone(), backend);
    }
    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_backend_answers_last_line() {
        let backend = EchoBackend::new("local");
        let out = backend
            .complete("system\nsummarise sales", &CompletionParams::default())
            .await
            .unwrap();
        assert_eq!(out.text, "[local] summarise sales");
        assert_eq!(out.cost, None);
    }

    #[test]
    fn test_unknown_provider_requires_injection() {
        let configs = vec![BackendConfig {
            id: "gpt".to_string(),
            provider: "openai".to_string(),
            cost_per_call: 0.01,
            latency_ms: 800,
            local: false,
        }];
        let err = build_backends(&configs).err().unwrap();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }
}
