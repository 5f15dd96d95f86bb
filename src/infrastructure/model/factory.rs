use std::env;
use std::sync::Arc;

use tracing::warn;

use super::{GeminiProvider, ModelError, ModelProvider, OllamaProvider};
use crate::config::ModelConfig;

/// Reads the API key from the environment variable named in config. A
/// missing key is only warned about here; the provider reports it as a
/// call-time error so startup can still bring up the tool server.
pub fn resolve_api_key(provider: &str, variable: &str) -> Option<String> {
    let variable = variable.trim();
    if variable.is_empty() {
        return None;
    }
    match env::var(variable) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        Ok(_) => {
            warn!(provider, env_var = variable, "API key environment variable is empty");
            None
        }
        Err(_) => {
            warn!(provider, env_var = variable, "API key environment variable is not set");
            None
        }
    }
}

/// Builds the configured provider. An unknown provider name is a fatal
/// configuration error; nothing should start serving against it.
pub fn build_provider(config: &ModelConfig) -> Result<Arc<dyn ModelProvider>, ModelError> {
    match config.provider.to_lowercase().as_str() {
        "gemini" | "google" | "google-ai" => Ok(Arc::new(GeminiProvider::from_config(config))),
        "ollama" | "localai" => Ok(Arc::new(OllamaProvider::from_config(config))),
        other => Err(ModelError::provider_not_found(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.to_string(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn known_providers_resolve() {
        assert_eq!(build_provider(&config("gemini")).unwrap().id(), "gemini");
        assert_eq!(build_provider(&config("Ollama")).unwrap().id(), "ollama");
    }

    #[test]
    fn unknown_provider_is_fatal() {
        assert!(matches!(
            build_provider(&config("claude")),
            Err(ModelError::ProviderNotFound { provider }) if provider == "claude"
        ));
    }

    #[test]
    fn blank_key_variable_resolves_to_none() {
        assert_eq!(resolve_api_key("gemini", ""), None);
        assert_eq!(resolve_api_key("gemini", "   "), None);
    }
}
