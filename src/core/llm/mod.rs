//! Backend abstraction and failover.

pub mod generic_provider;
pub mod registry;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::core::queue::Invoker;
use retry::{RetryPolicy, call_with_retry};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub text: String,
    pub usage: TokenUsage,
    /// Reasoning trace, when the backend exposes one (DeepSeek does).
    pub reasoning: Option<String>,
}

/// One unit of generation work: a label for logs plus the prompt pair.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub label: String,
    pub system: String,
    pub user: String,
    pub model: Option<String>,
}

/// A text-generation backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;
    fn default_model(&self) -> &str;
    async fn generate(&self, model_id: &str, messages: &[ChatMessage]) -> Result<GenerateOutput>;
}

/// Routes requests across registered backends with per-backend retry and
/// ordered failover. Backends are tried in `backend_order`; each gets its
/// full retry budget before the next is attempted.
pub struct LlmManager {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    backend_order: Vec<String>,
    /// Per-backend model override, keyed by backend id.
    model_overrides: HashMap<String, String>,
    retry: RetryPolicy,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
}

impl LlmManager {
    pub fn new(backend_order: Vec<String>, retry: RetryPolicy) -> Self {
        LlmManager {
            providers: HashMap::new(),
            backend_order,
            model_overrides: HashMap::new(),
            retry,
            tokens_in: AtomicU64::new(0),
            tokens_out: AtomicU64::new(0),
        }
    }

    pub fn set_model_overrides(&mut self, overrides: HashMap<String, String>) {
        self.model_overrides = overrides;
    }

    pub fn register_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.provider_id().to_string(), provider);
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Total tokens consumed since startup, across all backends.
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input: self.tokens_in.load(Ordering::Relaxed),
            output: self.tokens_out.load(Ordering::Relaxed),
        }
    }

    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateOutput> {
        let messages = [
            ChatMessage::system(request.system.clone()),
            ChatMessage::user(request.user.clone()),
        ];
        let mut failures: Vec<(String, String)> = Vec::new();
        for backend_id in &self.backend_order {
            let Some(provider) = self.providers.get(backend_id) else {
                continue;
            };
            let model = request
                .model
                .clone()
                .or_else(|| self.model_overrides.get(backend_id).cloned())
                .unwrap_or_else(|| provider.default_model().to_string());
            let label = format!("{} via {}", request.label, backend_id);
            let attempt = call_with_retry(&self.retry, &label, || {
                provider.generate(&model, &messages)
            })
            .await;
            match attempt {
                Ok(output) => {
                    self.tokens_in.fetch_add(output.usage.input, Ordering::Relaxed);
                    self.tokens_out.fetch_add(output.usage.output, Ordering::Relaxed);
                    info!(
                        backend = %backend_id,
                        tokens_in = output.usage.input,
                        tokens_out = output.usage.output,
                        "{} succeeded", request.label
                    );
                    return Ok(output);
                }
                Err(e) => {
                    warn!(backend = %backend_id, "{} exhausted retries: {}", request.label, e);
                    failures.push((backend_id.clone(), format!("{}", e)));
                }
            }
        }
        if failures.is_empty() {
            bail!(
                "no configured backend available (wanted one of: {})",
                self.backend_order.join(", ")
            );
        }
        let detail = failures
            .iter()
            .map(|(id, msg)| format!("{}: {}", id, msg))
            .collect::<Vec<_>>()
            .join("; ");
        Err(anyhow!("all backends failed for {} ({})", request.label, detail))
    }
}

#[async_trait]
impl Invoker for LlmManager {
    async fn invoke(&self, request: GenerateRequest) -> Result<GenerateOutput> {
        self.generate(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeProvider {
        id: &'static str,
        calls: AtomicUsize,
        behavior: Behavior,
    }

    enum Behavior {
        AlwaysFail(&'static str),
        AlwaysSucceed(&'static str),
    }

    #[async_trait]
    impl LlmProvider for FakeProvider {
        fn provider_id(&self) -> &str {
            self.id
        }

        fn default_model(&self) -> &str {
            "fake-model"
        }

        async fn generate(&self, _model: &str, _messages: &[ChatMessage]) -> Result<GenerateOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::AlwaysFail(msg) => bail!("{}", msg),
                Behavior::AlwaysSucceed(text) => Ok(GenerateOutput {
                    text: text.to_string(),
                    usage: TokenUsage { input: 10, output: 20 },
                    reasoning: None,
                }),
            }
        }
    }

    fn instant_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 0,
            multiplier: 2.0,
            max_delay_ms: 0,
        }
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            label: "test call".to_string(),
            system: "sys".to_string(),
            user: "usr".to_string(),
            model: None,
        }
    }

    #[tokio::test]
    async fn failover_returns_second_backend_result() {
        let mut manager = LlmManager::new(
            vec!["primary".to_string(), "secondary".to_string()],
            instant_retry(),
        );
        let primary = Arc::new(FakeProvider {
            id: "primary",
            calls: AtomicUsize::new(0),
            behavior: Behavior::AlwaysFail("connection refused"),
        });
        let secondary = Arc::new(FakeProvider {
            id: "secondary",
            calls: AtomicUsize::new(0),
            behavior: Behavior::AlwaysSucceed("fallback text"),
        });
        manager.register_provider(primary.clone());
        manager.register_provider(secondary.clone());

        let out = manager.generate(&request()).await.unwrap();
        assert_eq!(out.text, "fallback text");
        // Primary got its full retry budget before failover.
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn aggregate_error_names_every_backend() {
        let mut manager = LlmManager::new(
            vec!["primary".to_string(), "secondary".to_string()],
            instant_retry(),
        );
        manager.register_provider(Arc::new(FakeProvider {
            id: "primary",
            calls: AtomicUsize::new(0),
            behavior: Behavior::AlwaysFail("timeout"),
        }));
        manager.register_provider(Arc::new(FakeProvider {
            id: "secondary",
            calls: AtomicUsize::new(0),
            behavior: Behavior::AlwaysFail("quota exceeded"),
        }));

        let err = manager.generate(&request()).await.unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("primary: timeout"), "{}", msg);
        assert!(msg.contains("secondary: quota exceeded"), "{}", msg);
    }

    #[tokio::test]
    async fn unregistered_backends_in_order_are_skipped() {
        let mut manager = LlmManager::new(
            vec!["missing".to_string(), "present".to_string()],
            instant_retry(),
        );
        manager.register_provider(Arc::new(FakeProvider {
            id: "present",
            calls: AtomicUsize::new(0),
            behavior: Behavior::AlwaysSucceed("ok"),
        }));
        let out = manager.generate(&request()).await.unwrap();
        assert_eq!(out.text, "ok");
    }

    #[tokio::test]
    async fn usage_accumulates_across_calls() {
        let mut manager = LlmManager::new(vec!["p".to_string()], instant_retry());
        manager.register_provider(Arc::new(FakeProvider {
            id: "p",
            calls: AtomicUsize::new(0),
            behavior: Behavior::AlwaysSucceed("ok"),
        }));
        manager.generate(&request()).await.unwrap();
        manager.generate(&request()).await.unwrap();
        let usage = manager.usage();
        assert_eq!(usage.input, 20);
        assert_eq!(usage.output, 40);
    }
}
