use std::env;

/// Application settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// OpenAI API key
    pub openai_api_key: Option<String>,
    /// Groq API key (OpenAI-compatible endpoint)
    pub groq_api_key: Option<String>,
    /// Base URL for a custom OpenAI-compatible provider
    pub custom_provider_url: Option<String>,
    /// API key for the custom provider
    pub custom_provider_api_key: Option<String>,
    /// Environment name (development, production)
    pub environment: String,
    /// Maximum upload size in megabytes
    pub max_file_size_mb: u64,
    /// Allowed upload file extensions
    pub allowed_file_types: Vec<String>,
    /// CORS allowed origins
    pub allowed_origins: Vec<String>,
    /// General per-IP rate limit (requests per minute)
    pub rate_limit_per_minute: u32,
    /// Per-IP rate limit for the evaluate endpoint (requests per minute)
    pub evaluation_rate_limit_per_minute: u32,
    /// Model used when a request names none
    pub default_model: String,
    /// Providers enabled for this deployment
    pub enabled_providers: Vec<String>,
    /// Minimum spacing between provider calls, as requests per second
    pub provider_rate_limit_rps: f64,
    /// Default sampling temperature
    pub temperature: f64,
    /// Default maximum tokens to generate
    pub max_tokens: u32,
    /// Default nucleus sampling parameter
    pub top_p: f64,
    /// Default frequency penalty
    pub frequency_penalty: f64,
    /// Keywords treated as prompt-injection markers
    pub injection_keywords: Vec<String>,
    /// Whether the toxicity keyword heuristic runs on model output
    pub enable_toxicity_detection: bool,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

const DEFAULT_INJECTION_KEYWORDS: &str = "ignore previous,disregard instructions,act as,\
pretend to be,forget everything,new instructions";

impl Settings {
    /// Load settings from the process environment, falling back to the
    /// development defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            groq_api_key: env::var("GROQ_API_KEY").ok(),
            custom_provider_url: env::var("CUSTOM_PROVIDER_URL").ok(),
            custom_provider_api_key: env::var("CUSTOM_PROVIDER_API_KEY").ok(),
            environment: var_or("ENVIRONMENT", "development"),
            max_file_size_mb: var_or("MAX_FILE_SIZE_MB", "5").parse().unwrap_or(5),
            allowed_file_types: parse_list(&var_or("ALLOWED_FILE_TYPES", ".csv,.jsonl")),
            allowed_origins: parse_list(&var_or(
                "ALLOWED_ORIGINS",
                "http://localhost:3000,http://127.0.0.1:3000",
            )),
            rate_limit_per_minute: var_or("RATE_LIMIT_PER_MINUTE", "60").parse().unwrap_or(60),
            evaluation_rate_limit_per_minute: var_or("EVALUATION_RATE_LIMIT_PER_MINUTE", "10")
                .parse()
                .unwrap_or(10),
            default_model: var_or("DEFAULT_MODEL", "gpt-3.5-turbo"),
            enabled_providers: parse_list(&var_or("ENABLED_PROVIDERS", "openai")),
            provider_rate_limit_rps: var_or("PROVIDER_RATE_LIMIT_RPS", "10.0")
                .parse()
                .unwrap_or(10.0),
            temperature: var_or("TEMPERATURE", "0.7").parse().unwrap_or(0.7),
            max_tokens: var_or("MAX_TOKENS", "1000").parse().unwrap_or(1000),
            top_p: var_or("TOP_P", "1.0").parse().unwrap_or(1.0),
            frequency_penalty: var_or("FREQUENCY_PENALTY", "0.0").parse().unwrap_or(0.0),
            injection_keywords: parse_list(
                &var_or("INJECTION_KEYWORDS", DEFAULT_INJECTION_KEYWORDS).to_lowercase(),
            ),
            enable_toxicity_detection: var_or("ENABLE_TOXICITY_DETECTION", "false")
                .parse()
                .unwrap_or(false),
        }
    }

    /// Maximum upload size in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn provider_enabled(&self, name: &str) -> bool {
        self.enabled_providers.iter().any(|p| p == name)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            groq_api_key: None,
            custom_provider_url: None,
            custom_provider_api_key: None,
            environment: "development".to_string(),
            max_file_size_mb: 5,
            allowed_file_types: vec![".csv".to_string(), ".jsonl".to_string()],
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            rate_limit_per_minute: 60,
            evaluation_rate_limit_per_minute: 10,
            default_model: "gpt-3.5-turbo".to_string(),
            enabled_providers: vec!["openai".to_string()],
            provider_rate_limit_rps: 10.0,
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            injection_keywords: parse_list(DEFAULT_INJECTION_KEYWORDS),
            enable_toxicity_detection: false,
        }
    }
}
