use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::registry::{ApiFormat, AuthType, ProviderDef};
use super::{ChatMessage, GenerateOutput, LlmProvider, TokenUsage};

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    content: String,
    /// DeepSeek's reasoner models return the chain of thought here.
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// ── Gemini request/response ──

#[derive(Serialize)]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResContent,
}

#[derive(Deserialize)]
struct GeminiResContent {
    parts: Vec<GeminiResPart>,
}

#[derive(Deserialize)]
struct GeminiResPart {
    text: String,
}

#[derive(Deserialize, Default)]
struct GeminiUsage {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u64,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u64,
}

// ── Generic Provider ──

/// HTTP-backed provider driven entirely by its registry definition.
pub struct GenericProvider {
    provider_def: ProviderDef,
    api_key: String,
    client: Client,
}

impl GenericProvider {
    pub fn new(provider_def: ProviderDef, api_key: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            provider_def,
            api_key,
            client,
        }
    }

    async fn generate_openai(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<GenerateOutput> {
        let req_messages: Vec<OpenAiMessage> = messages
            .iter()
            .map(|m| OpenAiMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect();

        let req = OpenAiRequest {
            model: model_id,
            messages: req_messages,
        };

        let mut request = self.client.post(&self.provider_def.base_url).json(&req);
        if self.provider_def.auth.auth_type == AuthType::Bearer {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }
        for (name, value) in &self.provider_def.extra_headers {
            request = request.header(name, value);
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "{} API error: {}",
                self.provider_def.name,
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: OpenAiResponse = res.json().await?;
        let usage = parsed.usage.unwrap_or_default();
        let (text, reasoning) = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| (c.message.content, c.message.reasoning_content))
            .unwrap_or_default();
        Ok(GenerateOutput {
            text,
            usage: TokenUsage {
                input: usage.prompt_tokens,
                output: usage.completion_tokens,
            },
            reasoning,
        })
    }

    async fn generate_gemini(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<GenerateOutput> {
        let mut system_instruction: Option<GeminiContent> = None;
        let mut contents = Vec::new();

        for m in messages {
            if m.role == "system" {
                system_instruction = Some(GeminiContent {
                    role: "user".to_string(),
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                });
            } else {
                let gemini_role = if m.role == "assistant" { "model" } else { "user" };
                contents.push(GeminiContent {
                    role: gemini_role.to_string(),
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                });
            }
        }

        let req = GeminiRequest {
            system_instruction,
            contents,
        };

        let base = self.provider_def.base_url.replace("{model}", model_id);
        let url = match self.provider_def.auth.auth_type {
            AuthType::QueryParam => {
                let param_name = self
                    .provider_def
                    .auth
                    .param_name
                    .as_deref()
                    .unwrap_or("key");
                format!("{}?{}={}", base, param_name, self.api_key)
            }
            AuthType::Bearer => base,
        };

        let mut request = self.client.post(&url).json(&req);
        if self.provider_def.auth.auth_type == AuthType::Bearer {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "{} API error: {}",
                self.provider_def.name,
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: GeminiResponse = res.json().await?;
        let usage = parsed.usage_metadata.unwrap_or_default();
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();
        Ok(GenerateOutput {
            text,
            usage: TokenUsage {
                input: usage.prompt_token_count,
                output: usage.candidates_token_count,
            },
            reasoning: None,
        })
    }
}

#[async_trait]
impl LlmProvider for GenericProvider {
    fn provider_id(&self) -> &str {
        &self.provider_def.id
    }

    fn default_model(&self) -> &str {
        &self.provider_def.default_model
    }

    async fn generate(&self, model_id: &str, messages: &[ChatMessage]) -> Result<GenerateOutput> {
        match self.provider_def.api_format {
            ApiFormat::Openai => self.generate_openai(model_id, messages).await,
            ApiFormat::Gemini => self.generate_gemini(model_id, messages).await,
        }
    }
}
