use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single dataset row: prompt plus the output it is expected to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    /// The input prompt
    pub prompt: String,
    /// Expected model response
    #[serde(alias = "expectedOutput")]
    pub expected_output: String,
    /// Extra columns carried through from the uploaded file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl PromptRecord {
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            bail!("prompt cannot be empty");
        }
        if self.expected_output.trim().is_empty() {
            bail!("expected_output cannot be empty");
        }
        Ok(())
    }
}

/// Generation parameters forwarded to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_top_p() -> f64 {
    1.0
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 1.0,
            frequency_penalty: 0.0,
        }
    }
}

impl ModelParameters {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("temperature must be between 0.0 and 2.0");
        }
        if self.max_tokens == 0 || self.max_tokens > 4000 {
            bail!("max_tokens must be between 1 and 4000");
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            bail!("top_p must be between 0.0 and 1.0");
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            bail!("frequency_penalty must be between -2.0 and 2.0");
        }
        Ok(())
    }
}

/// ROUGE precision/recall/F1 triple.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RougeScore {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Optional n-gram and similarity metrics computed alongside exact/fuzzy match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedMetrics {
    /// BLEU score (0-1)
    pub bleu_score: f64,
    /// ROUGE scores keyed "rouge-1", "rouge-2", "rouge-l"
    pub rouge_scores: HashMap<String, RougeScore>,
    /// Similarity scores keyed "tfidf", "jaccard", "sequence"
    pub semantic_similarity: HashMap<String, f64>,
}

/// One evaluated prompt/response pair with its scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub id: String,
    pub prompt: String,
    #[serde(alias = "modelResponse")]
    pub model_response: String,
    #[serde(alias = "expectedOutput")]
    pub expected_output: String,
    /// Exact match score, 0 or 100
    #[serde(alias = "exactMatch")]
    pub exact_match: f64,
    /// Fuzzy match score, 0-100
    #[serde(alias = "fuzzyMatch")]
    pub fuzzy_match: f64,
    pub toxicity: bool,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// ISO-8601 timestamp of the evaluation
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ModelParameters>,
    #[serde(default, alias = "securityFlags", skip_serializing_if = "Option::is_none")]
    pub security_flags: Option<Vec<String>>,
    #[serde(default, alias = "advancedMetrics", skip_serializing_if = "Option::is_none")]
    pub advanced_metrics: Option<AdvancedMetrics>,
}

/// Count of scores falling into one quartile range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBucket {
    /// Range label, e.g. "0-25%"
    pub range: String,
    pub exact_match: usize,
    pub fuzzy_match: usize,
}

/// Averages of the advanced metrics across a result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedMetricsSummary {
    pub average_bleu_score: f64,
    pub average_rouge_f1: HashMap<String, f64>,
    pub average_semantic_similarity: HashMap<String, f64>,
}

/// Aggregate statistics for one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total_prompts: usize,
    pub average_exact_match: f64,
    pub average_fuzzy_match: f64,
    /// Results with exact match below 50, toxicity, or any security flag
    pub flagged_prompts: usize,
    /// Average per-result security score (higher is safer)
    pub security_score: f64,
    pub models_used: Vec<String>,
    /// Wall-clock evaluation time in seconds
    pub evaluation_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced_metrics_summary: Option<AdvancedMetricsSummary>,
    pub score_distribution: Vec<ScoreBucket>,
}

// --- request/response envelopes ---

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub data: Vec<PromptRecord>,
    pub total_prompts: usize,
    /// First five records, for the dashboard preview pane
    pub preview: Vec<PromptRecord>,
}

pub const MAX_PROMPTS_PER_EVALUATION: usize = 100;

#[derive(Debug, Deserialize)]
pub struct EvaluationRequest {
    pub prompts: Vec<PromptRecord>,
    pub model: String,
    #[serde(default)]
    pub parameters: Option<ModelParameters>,
    /// Compute BLEU/ROUGE/semantic similarity per result
    #[serde(default)]
    pub include_advanced_metrics: bool,
}

impl EvaluationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.prompts.is_empty() {
            bail!("No prompts provided for evaluation");
        }
        if self.prompts.len() > MAX_PROMPTS_PER_EVALUATION {
            bail!(
                "Maximum {} prompts allowed per evaluation",
                MAX_PROMPTS_PER_EVALUATION
            );
        }
        for record in &self.prompts {
            record.validate()?;
        }
        if let Some(params) = &self.parameters {
            params.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct EvaluationResponse {
    pub success: bool,
    pub message: String,
    pub evaluation_id: String,
    pub results: Vec<EvaluationResult>,
    pub total_evaluations: usize,
    pub summary: EvaluationSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    /// Specific results to export; everything stored when absent
    #[serde(default)]
    pub results: Option<Vec<EvaluationResult>>,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub environment: String,
}

/// Catalog entry describing a selectable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PromptRecord {
        PromptRecord {
            prompt: "What is the capital of France?".to_string(),
            expected_output: "Paris".to_string(),
            metadata: None,
        }
    }

    #[test]
    fn test_prompt_record_validation() {
        assert!(sample_record().validate().is_ok());

        let empty_prompt = PromptRecord {
            prompt: "   ".to_string(),
            ..sample_record()
        };
        assert!(empty_prompt.validate().is_err());

        let empty_expected = PromptRecord {
            expected_output: String::new(),
            ..sample_record()
        };
        assert!(empty_expected.validate().is_err());
    }

    #[test]
    fn test_model_parameters_defaults() {
        let params: ModelParameters = serde_json::from_str("{}").unwrap();
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.max_tokens, 1000);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.frequency_penalty, 0.0);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_model_parameters_range_validation() {
        let mut params = ModelParameters::default();
        params.temperature = 2.5;
        assert!(params.validate().is_err());

        let mut params = ModelParameters::default();
        params.max_tokens = 0;
        assert!(params.validate().is_err());

        let mut params = ModelParameters::default();
        params.top_p = 1.5;
        assert!(params.validate().is_err());

        let mut params = ModelParameters::default();
        params.frequency_penalty = -3.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_evaluation_request_limits() {
        let request = EvaluationRequest {
            prompts: vec![],
            model: "gpt-4".to_string(),
            parameters: None,
            include_advanced_metrics: false,
        };
        assert!(request.validate().is_err());

        let request = EvaluationRequest {
            prompts: vec![sample_record(); MAX_PROMPTS_PER_EVALUATION + 1],
            model: "gpt-4".to_string(),
            parameters: None,
            include_advanced_metrics: false,
        };
        assert!(request.validate().is_err());

        let request = EvaluationRequest {
            prompts: vec![sample_record()],
            model: "gpt-4".to_string(),
            parameters: Some(ModelParameters::default()),
            include_advanced_metrics: true,
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_evaluation_result_accepts_camel_case_aliases() {
        let json = r#"{
            "id": "1",
            "prompt": "p",
            "modelResponse": "r",
            "expectedOutput": "e",
            "exactMatch": 100.0,
            "fuzzyMatch": 88.5,
            "toxicity": false,
            "model": "gpt-4",
            "timestamp": "2024-01-01T00:00:00Z",
            "securityFlags": ["prompt_injection"]
        }"#;
        let result: EvaluationResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.model_response, "r");
        assert_eq!(result.exact_match, 100.0);
        assert_eq!(
            result.security_flags,
            Some(vec!["prompt_injection".to_string()])
        );
    }

    #[test]
    fn test_export_format_parsing() {
        let format: ExportFormat = serde_json::from_str(r#""csv""#).unwrap();
        assert_eq!(format, ExportFormat::Csv);
        let format: ExportFormat = serde_json::from_str(r#""json""#).unwrap();
        assert_eq!(format, ExportFormat::Json);
    }
}
