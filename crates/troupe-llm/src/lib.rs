pub mod providers;
mod toolcall;

use std::sync::Arc;

use troupe_core::config::BackendConfig;
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::GenerationBackend;
use troupe_tools::ToolRegistry;

pub use providers::ollama::OllamaBackend;
pub use providers::openai::OpenAiBackend;

/// Create a generation backend based on the provider name.
pub fn create_backend(
    config: &BackendConfig,
    registry: Arc<ToolRegistry>,
) -> Result<Arc<dyn GenerationBackend>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiBackend::new(config.clone(), registry))),
        "ollama" => Ok(Arc::new(OllamaBackend::new(config.clone(), registry))),
        other => Err(TroupeError::UnsupportedProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> BackendConfig {
        BackendConfig {
            provider: provider.to_string(),
            model_id: "m".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: 1024,
            temperature: 0.7,
            max_tool_rounds: 4,
        }
    }

    #[test]
    fn test_create_backend_known_providers() {
        let registry = Arc::new(ToolRegistry::new());
        assert!(create_backend(&config("openai"), registry.clone()).is_ok());
        assert!(create_backend(&config("ollama"), registry).is_ok());
    }

    #[test]
    fn test_create_backend_unknown_provider() {
        let registry = Arc::new(ToolRegistry::new());
        let err = create_backend(&config("palm"), registry).unwrap_err();
        assert!(matches!(err, TroupeError::UnsupportedProvider(_)));
    }
}
