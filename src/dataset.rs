use crate::models::PromptRecord;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;

/// Column names accepted as the prompt field, in priority order.
const PROMPT_FIELDS: [&str; 4] = ["prompt", "question", "input", "query"];

/// Column names accepted as the expected-output field, in priority order.
const EXPECTED_FIELDS: [&str; 6] = [
    "expected_output",
    "expected",
    "answer",
    "output",
    "target",
    "ground_truth",
];

/// Check an upload's extension against the configured allow-list.
pub fn validate_file_type(filename: &str, allowed_extensions: &[String]) -> Result<()> {
    if filename.is_empty() {
        bail!("Filename is required");
    }
    let lower = filename.to_lowercase();
    if allowed_extensions
        .iter()
        .any(|ext| lower.ends_with(&ext.to_lowercase()))
    {
        return Ok(());
    }
    bail!(
        "Unsupported file type. Allowed types: {}",
        allowed_extensions.join(", ")
    )
}

fn sniff_delimiter(content: &str) -> u8 {
    let first_line = content.lines().next().unwrap_or("");
    if !first_line.contains(',') {
        if first_line.contains('\t') {
            return b'\t';
        }
        if first_line.contains(';') {
            return b';';
        }
    }
    b','
}

/// Parse CSV text into row maps keyed by lowercased, trimmed header names.
/// Rows whose cells are all empty are skipped.
pub fn parse_csv(content: &str) -> Result<Vec<HashMap<String, String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(content))
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header row")?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to parse CSV row")?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let mut row = HashMap::new();
        for (key, value) in headers.iter().zip(record.iter()) {
            if !key.is_empty() {
                row.insert(key.clone(), value.trim().to_string());
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }

    if rows.is_empty() {
        bail!("CSV file is empty or contains no valid data");
    }
    Ok(rows)
}

/// Parse JSONL text, one JSON object per non-empty line. Lines holding valid
/// JSON that is not an object are skipped; malformed JSON is an error.
pub fn parse_jsonl(content: &str) -> Result<(Vec<HashMap<String, String>>, Vec<String>)> {
    let mut rows = Vec::new();
    let mut warnings = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on line {}", index + 1))?;
        match value {
            serde_json::Value::Object(map) => {
                let row = map
                    .into_iter()
                    .map(|(k, v)| {
                        let text = match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        (k.to_lowercase(), text)
                    })
                    .collect();
                rows.push(row);
            }
            _ => warnings.push(format!("Line {} is not a JSON object, skipping", index + 1)),
        }
    }

    if rows.is_empty() {
        bail!("JSONL file is empty or contains no valid JSON objects");
    }
    Ok((rows, warnings))
}

fn find_field(row: &HashMap<String, String>, candidates: &[&str]) -> Option<String> {
    for field in candidates {
        if let Some(value) = row.get(*field) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Normalize parsed rows into prompt records. The first present non-empty
/// alias wins for each of the two required fields; any other columns are kept
/// as row metadata.
pub fn normalize_rows(rows: Vec<HashMap<String, String>>) -> Result<Vec<PromptRecord>> {
    let mut records = Vec::with_capacity(rows.len());

    for (index, row) in rows.iter().enumerate() {
        let available = || {
            let mut keys: Vec<&str> = row.keys().map(String::as_str).collect();
            keys.sort_unstable();
            keys.join(", ")
        };

        let prompt = find_field(row, &PROMPT_FIELDS).with_context(|| {
            format!(
                "Row {}: No valid prompt field found. Available fields: [{}]. Expected one of: {:?}",
                index + 1,
                available(),
                PROMPT_FIELDS
            )
        })?;

        let expected_output = find_field(row, &EXPECTED_FIELDS).with_context(|| {
            format!(
                "Row {}: No valid expected output field found. Available fields: [{}]. Expected one of: {:?}",
                index + 1,
                available(),
                EXPECTED_FIELDS
            )
        })?;

        let metadata: HashMap<String, String> = row
            .iter()
            .filter(|(key, value)| {
                !PROMPT_FIELDS.contains(&key.as_str())
                    && !EXPECTED_FIELDS.contains(&key.as_str())
                    && !value.trim().is_empty()
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        records.push(PromptRecord {
            prompt,
            expected_output,
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(metadata)
            },
        });
    }

    Ok(records)
}

/// Decode and parse an uploaded file into prompt records plus any warnings.
pub fn process_upload(content: &[u8], filename: &str) -> Result<(Vec<PromptRecord>, Vec<String>)> {
    let text = String::from_utf8_lossy(content);
    let lower = filename.to_lowercase();

    let (rows, mut warnings) = if lower.ends_with(".csv") {
        (parse_csv(&text)?, Vec::new())
    } else if lower.ends_with(".jsonl") {
        parse_jsonl(&text)?
    } else {
        bail!("Unsupported file format");
    };

    let raw_count = rows.len();
    let records = normalize_rows(rows)?;
    if records.len() != raw_count {
        warnings.push(format!(
            "Filtered out {} empty rows",
            raw_count - records.len()
        ));
    }

    Ok((records, warnings))
}
