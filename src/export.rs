use crate::models::{EvaluationResult, ExportFormat};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

const BASE_COLUMNS: [&str; 9] = [
    "ID",
    "Prompt",
    "Model Response",
    "Expected Output",
    "Exact Match (%)",
    "Fuzzy Match (%)",
    "Toxicity",
    "Model",
    "Timestamp",
];

const METADATA_COLUMNS: [&str; 5] = [
    "Security Flags",
    "Temperature",
    "Max Tokens",
    "Top P",
    "Frequency Penalty",
];

/// Timestamped download filename for the given format.
pub fn export_filename(format: ExportFormat) -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let extension = match format {
        ExportFormat::Csv => "csv",
        ExportFormat::Json => "json",
    };
    format!("llm_evaluation_results_{stamp}.{extension}")
}

fn format_score(score: f64) -> String {
    format!("{score:.2}")
}

/// Serialize results as CSV with a fixed column order. Parameter and
/// security columns are appended when metadata is included.
pub fn to_csv(results: &[EvaluationResult], include_metadata: bool) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<&str> = BASE_COLUMNS.to_vec();
    if include_metadata {
        header.extend(METADATA_COLUMNS);
    }
    writer
        .write_record(&header)
        .context("Failed to write CSV header")?;

    for result in results {
        let mut row = vec![
            result.id.clone(),
            result.prompt.clone(),
            result.model_response.clone(),
            result.expected_output.clone(),
            format_score(result.exact_match),
            format_score(result.fuzzy_match),
            if result.toxicity { "Yes" } else { "No" }.to_string(),
            result.model.clone(),
            result.timestamp.clone(),
        ];
        if include_metadata {
            let flags = result
                .security_flags
                .as_ref()
                .map(|f| f.join("; "))
                .unwrap_or_default();
            row.push(flags);
            match &result.parameters {
                Some(params) => {
                    row.push(params.temperature.to_string());
                    row.push(params.max_tokens.to_string());
                    row.push(params.top_p.to_string());
                    row.push(params.frequency_penalty.to_string());
                }
                None => row.extend(std::iter::repeat(String::new()).take(4)),
            }
        }
        writer
            .write_record(&row)
            .context("Failed to write CSV row")?;
    }

    let bytes = writer
        .into_inner()
        .context("Failed to flush CSV output")?;
    String::from_utf8(bytes).context("CSV output was not valid UTF-8")
}

/// Serialize results as pretty JSON under an export envelope.
pub fn to_json(results: &[EvaluationResult], include_metadata: bool) -> Result<String> {
    let results_value = if include_metadata {
        serde_json::to_value(results).context("Failed to serialize results")?
    } else {
        // Strip parameters and security flags when metadata is excluded.
        let stripped: Vec<EvaluationResult> = results
            .iter()
            .map(|r| EvaluationResult {
                parameters: None,
                security_flags: None,
                ..r.clone()
            })
            .collect();
        serde_json::to_value(stripped).context("Failed to serialize results")?
    };

    let document = json!({
        "export_info": {
            "exported_at": Utc::now().to_rfc3339(),
            "total_results": results.len(),
            "format": "json",
            "include_metadata": include_metadata,
        },
        "results": results_value,
    });
    serde_json::to_string_pretty(&document).context("Failed to serialize export document")
}

/// Render results in the requested format, returning the body and its
/// content type.
pub fn export(
    results: &[EvaluationResult],
    format: ExportFormat,
    include_metadata: bool,
) -> Result<(String, &'static str)> {
    match format {
        ExportFormat::Csv => Ok((to_csv(results, include_metadata)?, "text/csv")),
        ExportFormat::Json => Ok((to_json(results, include_metadata)?, "application/json")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelParameters;

    fn sample_result() -> EvaluationResult {
        EvaluationResult {
            id: "abc-123".to_string(),
            prompt: "What is 2+2?".to_string(),
            model_response: "4".to_string(),
            expected_output: "4".to_string(),
            exact_match: 100.0,
            fuzzy_match: 100.0,
            toxicity: false,
            model: "gpt-3.5-turbo".to_string(),
            provider: Some("openai".to_string()),
            timestamp: "2024-06-01T12:00:00Z".to_string(),
            parameters: Some(ModelParameters::default()),
            security_flags: Some(vec!["jailbreak_attempt".to_string()]),
            advanced_metrics: None,
        }
    }

    #[test]
    fn test_csv_base_columns() {
        let csv = to_csv(&[sample_result()], false).unwrap();
        let mut lines = csv.lines();
        let header = lines.next().unwrap();
        assert_eq!(
            header,
            "ID,Prompt,Model Response,Expected Output,Exact Match (%),\
             Fuzzy Match (%),Toxicity,Model,Timestamp"
        );
        let row = lines.next().unwrap();
        assert!(row.contains("abc-123"));
        assert!(row.contains("100.00"));
        assert!(row.contains("No"));
    }

    #[test]
    fn test_csv_metadata_columns() {
        let csv = to_csv(&[sample_result()], true).unwrap();
        let header = csv.lines().next().unwrap();
        assert!(header.contains("Security Flags"));
        assert!(header.contains("Frequency Penalty"));
        let row = csv.lines().nth(1).unwrap();
        assert!(row.contains("jailbreak_attempt"));
        assert!(row.contains("0.7"));
        assert!(row.contains("1000"));
    }

    #[test]
    fn test_csv_round_trip() {
        let mut special = sample_result();
        special.prompt = "Line one\nwith \"quotes\", and commas".to_string();
        let csv = to_csv(&[special.clone(), sample_result()], false).unwrap();

        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], special.prompt.as_str());
        assert_eq!(&rows[0][6], "No");
    }

    #[test]
    fn test_csv_toxicity_yes() {
        let mut result = sample_result();
        result.toxicity = true;
        let csv = to_csv(&[result], false).unwrap();
        assert!(csv.lines().nth(1).unwrap().contains("Yes"));
    }

    #[test]
    fn test_json_envelope() {
        let output = to_json(&[sample_result()], true).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["export_info"]["total_results"], 1);
        assert_eq!(parsed["results"][0]["id"], "abc-123");
        assert!(parsed["results"][0]["security_flags"].is_array());
    }

    #[test]
    fn test_json_without_metadata_strips_parameters() {
        let output = to_json(&[sample_result()], false).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert!(parsed["results"][0].get("parameters").is_none());
        assert!(parsed["results"][0].get("security_flags").is_none());
    }

    #[test]
    fn test_export_filename() {
        let name = export_filename(ExportFormat::Csv);
        assert!(name.starts_with("llm_evaluation_results_"));
        assert!(name.ends_with(".csv"));
        assert!(export_filename(ExportFormat::Json).ends_with(".json"));
    }

    #[test]
    fn test_export_content_types() {
        let (_, content_type) = export(&[], ExportFormat::Csv, false).unwrap();
        assert_eq!(content_type, "text/csv");
        let (_, content_type) = export(&[], ExportFormat::Json, false).unwrap();
        assert_eq!(content_type, "application/json");
    }
}
