use crate::config::Settings;
use crate::models::{ModelInfo, ModelParameters};
use async_openai::{config::OpenAIConfig, types::CreateChatCompletionRequestArgs, Client};
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";

const SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer the question directly and concisely.";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider {0} is not enabled")]
    ProviderDisabled(String),
    #[error("API key for {0} is not configured")]
    MissingApiKey(String),
    #[error("Custom provider URL is not configured")]
    MissingCustomUrl,
    #[error("Failed to build completion request: {0}")]
    Request(#[from] async_openai::error::OpenAIError),
}

/// Backends reachable through the OpenAI-compatible chat completions API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Groq,
    Custom,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Groq => "groq",
            Provider::Custom => "custom",
        }
    }
}

/// Model text plus token usage reported by the provider.
#[derive(Debug, Clone)]
pub struct GeneratedResponse {
    pub content: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// The models selectable through the API, grouped by provider.
pub fn model_catalog() -> Vec<ModelInfo> {
    let entry = |id: &str, name: &str, provider: Provider, max_tokens: u32, context: u32| {
        ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
            provider: provider.name().to_string(),
            max_tokens,
            context_length: Some(context),
            description: None,
        }
    };

    vec![
        entry("gpt-4o", "GPT-4o", Provider::OpenAi, 4096, 128_000),
        entry("gpt-4-turbo", "GPT-4 Turbo", Provider::OpenAi, 4096, 128_000),
        entry("gpt-4", "GPT-4", Provider::OpenAi, 4096, 8_192),
        entry("gpt-3.5-turbo", "GPT-3.5 Turbo", Provider::OpenAi, 4096, 16_385),
        entry(
            "llama-3.1-70b-versatile",
            "Llama 3.1 70B",
            Provider::Groq,
            4096,
            131_072,
        ),
        entry(
            "llama-3.1-8b-instant",
            "Llama 3.1 8B",
            Provider::Groq,
            4096,
            131_072,
        ),
        entry(
            "mixtral-8x7b-32768",
            "Mixtral 8x7B",
            Provider::Groq,
            4096,
            32_768,
        ),
    ]
}

/// Catalog entries whose provider is enabled for this deployment.
pub fn available_models(settings: &Settings) -> Vec<ModelInfo> {
    let mut models: Vec<ModelInfo> = model_catalog()
        .into_iter()
        .filter(|m| settings.provider_enabled(&m.provider))
        .collect();

    if settings.provider_enabled(Provider::Custom.name()) && settings.custom_provider_url.is_some()
    {
        models.push(ModelInfo {
            id: "custom".to_string(),
            name: "Custom Provider".to_string(),
            provider: Provider::Custom.name().to_string(),
            max_tokens: 4096,
            context_length: None,
            description: Some("OpenAI-compatible endpoint from CUSTOM_PROVIDER_URL".to_string()),
        });
    }
    models
}

/// Map a model id to the provider that serves it. Models outside the catalog
/// route to the custom provider when one is configured, otherwise to OpenAI.
pub fn resolve_provider(model: &str, settings: &Settings) -> Provider {
    match model_catalog().iter().find(|m| m.id == model) {
        Some(info) if info.provider == "groq" => Provider::Groq,
        Some(_) => Provider::OpenAi,
        None => {
            if settings.provider_enabled(Provider::Custom.name())
                && settings.custom_provider_url.is_some()
            {
                Provider::Custom
            } else {
                Provider::OpenAi
            }
        }
    }
}

/// Stateless chat-completions client factory over the configured providers.
#[derive(Clone)]
pub struct ProviderClient {
    settings: Settings,
    /// Overrides every provider's API base, for tests
    api_base_override: Option<String>,
}

impl ProviderClient {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            api_base_override: None,
        }
    }

    #[cfg(test)]
    pub fn with_api_base(settings: Settings, api_base: String) -> Self {
        Self {
            settings,
            api_base_override: Some(api_base),
        }
    }

    fn create_client(&self, provider: Provider) -> Result<Client<OpenAIConfig>, ProviderError> {
        if !self.settings.provider_enabled(provider.name()) {
            return Err(ProviderError::ProviderDisabled(provider.name().to_string()));
        }

        let (api_key, api_base) = match provider {
            Provider::OpenAi => {
                let key = self
                    .settings
                    .openai_api_key
                    .clone()
                    .ok_or_else(|| ProviderError::MissingApiKey("openai".to_string()))?;
                (key, None)
            }
            Provider::Groq => {
                let key = self
                    .settings
                    .groq_api_key
                    .clone()
                    .ok_or_else(|| ProviderError::MissingApiKey("groq".to_string()))?;
                (key, Some(GROQ_API_BASE.to_string()))
            }
            Provider::Custom => {
                let url = self
                    .settings
                    .custom_provider_url
                    .clone()
                    .ok_or(ProviderError::MissingCustomUrl)?;
                let key = self
                    .settings
                    .custom_provider_api_key
                    .clone()
                    .unwrap_or_else(|| "none".to_string());
                (key, Some(url))
            }
        };

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = self.api_base_override.clone().or(api_base) {
            config = config.with_api_base(base);
        }
        Ok(Client::with_config(config))
    }

    fn build_request(
        &self,
        model: &str,
        prompt: &str,
        params: &ModelParameters,
    ) -> Result<async_openai::types::CreateChatCompletionRequest, ProviderError> {
        let system_message = async_openai::types::ChatCompletionRequestSystemMessageArgs::default()
            .content(SYSTEM_PROMPT)
            .build()?
            .into();

        let user_message = async_openai::types::ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.to_string())
            .build()?
            .into();

        Ok(CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([system_message, user_message])
            .temperature(params.temperature as f32)
            .max_tokens(params.max_tokens)
            .top_p(params.top_p as f32)
            .frequency_penalty(params.frequency_penalty as f32)
            .build()?)
    }

    fn extract_response(
        response: async_openai::types::CreateChatCompletionResponse,
    ) -> GeneratedResponse {
        let content = match response.choices.first() {
            Some(choice) => match &choice.message.content {
                Some(content) => content.clone(),
                None => String::new(),
            },
            None => String::new(),
        };

        let mut metadata = HashMap::new();
        if let Some(usage) = response.usage {
            metadata.insert("prompt_tokens".to_string(), json!(usage.prompt_tokens));
            metadata.insert(
                "completion_tokens".to_string(),
                json!(usage.completion_tokens),
            );
            metadata.insert("total_tokens".to_string(), json!(usage.total_tokens));
        }

        GeneratedResponse { content, metadata }
    }

    /// Send one prompt to the provider serving the given model.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &ModelParameters,
    ) -> Result<GeneratedResponse, ProviderError> {
        let provider = resolve_provider(model, &self.settings);
        let client = self.create_client(provider)?;
        let request = self.build_request(model, prompt, params)?;
        let response = client.chat().create(request).await?;
        Ok(Self::extract_response(response))
    }
}
