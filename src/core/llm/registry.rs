use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const PROVIDERS_JSON: &str = include_str!("providers.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDef {
    pub id: String,
    pub name: String,
    pub api_format: ApiFormat,
    /// Endpoint URL; may contain a `{model}` placeholder.
    pub base_url: String,
    pub auth: AuthConfig,
    /// Environment variable holding the API key.
    pub env_key: String,
    pub default_model: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub param_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    QueryParam,
}

impl ProviderRegistry {
    pub fn load() -> Self {
        serde_json::from_str(PROVIDERS_JSON).expect("providers.json is invalid")
    }

    pub fn get_provider(&self, id: &str) -> Option<&ProviderDef> {
        let normalized = id.to_lowercase();
        self.providers
            .iter()
            .find(|p| p.id == normalized || p.name.to_lowercase() == normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_registry_parses() {
        let registry = ProviderRegistry::load();
        assert!(registry.get_provider("deepseek").is_some());
        assert!(registry.get_provider("openrouter").is_some());
        assert!(registry.get_provider("gemini").is_some());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = ProviderRegistry::load();
        assert!(registry.get_provider("DeepSeek").is_some());
        assert!(registry.get_provider("nonexistent").is_none());
    }

    #[test]
    fn every_provider_names_an_env_key_and_default_model() {
        let registry = ProviderRegistry::load();
        for p in &registry.providers {
            assert!(!p.env_key.is_empty(), "{} missing env_key", p.id);
            assert!(!p.default_model.is_empty(), "{} missing default_model", p.id);
            assert!(p.models.contains(&p.default_model), "{} default not listed", p.id);
        }
    }
}
