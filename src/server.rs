use crate::config::Settings;
use crate::dataset;
use crate::evaluation::{self, Evaluator};
use crate::export;
use crate::models::{
    ErrorResponse, EvaluationRequest, EvaluationResponse, EvaluationResult, ExportFormat,
    ExportRequest, HealthResponse, ModelParameters, PromptRecord, UploadResponse,
    MAX_PROMPTS_PER_EVALUATION,
};
use crate::providers;
use crate::security::{client_ip, RateLimiter};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Progress record for one evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationStatus {
    pub evaluation_id: String,
    pub status: String,
    pub total_prompts: usize,
    pub completed_prompts: usize,
    pub created_at: String,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    evaluator: Arc<Evaluator>,
    results: Arc<RwLock<HashMap<String, Vec<EvaluationResult>>>>,
    statuses: Arc<RwLock<HashMap<String, EvaluationStatus>>>,
    api_limiter: Arc<RateLimiter>,
    eval_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let api_limiter = Arc::new(RateLimiter::new(settings.rate_limit_per_minute));
        let eval_limiter = Arc::new(RateLimiter::new(settings.evaluation_rate_limit_per_minute));
        let evaluator = Arc::new(Evaluator::new(settings.clone()));
        Self {
            settings,
            evaluator,
            results: Arc::new(RwLock::new(HashMap::new())),
            statuses: Arc::new(RwLock::new(HashMap::new())),
            api_limiter,
            eval_limiter,
        }
    }
}

/// Handler error mapped onto an HTTP status and JSON body.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    TooManyRequests(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn status_and_label(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            ApiError::TooManyRequests(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_label();
        let message = match &self {
            ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::PayloadTooLarge(m)
            | ApiError::TooManyRequests(m) => m.clone(),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                "Internal server error".to_string()
            }
        };
        let body = ErrorResponse {
            success: false,
            error: error.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::Internal(error)
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "llm-eval-api",
        "version": env!("CARGO_PKG_VERSION"),
        "docs": "/api/v1",
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.settings.environment.clone(),
    })
}

async fn upload_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "max_file_size_mb": state.settings.max_file_size_mb,
        "allowed_file_types": state.settings.allowed_file_types,
        "prompt_fields": ["prompt", "question", "input", "query"],
        "expected_output_fields": [
            "expected_output", "expected", "answer", "output", "target", "ground_truth"
        ],
    }))
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart request: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .ok_or_else(|| ApiError::BadRequest("Filename is required".to_string()))?
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {e}")))?;
        file = Some((filename, bytes.to_vec()));
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("No file field in request".to_string()))?;

    dataset::validate_file_type(&filename, &state.settings.allowed_file_types)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if bytes.len() as u64 > state.settings.max_file_size_bytes() {
        return Err(ApiError::PayloadTooLarge(format!(
            "File exceeds the {} MB limit",
            state.settings.max_file_size_mb
        )));
    }

    let (records, warnings) = dataset::process_upload(&bytes, &filename)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        filename = %filename,
        prompts = records.len(),
        warnings = warnings.len(),
        "dataset uploaded"
    );

    let mut message = format!("Successfully processed {} prompts", records.len());
    if !warnings.is_empty() {
        message = format!("{message} ({})", warnings.join("; "));
    }

    let preview: Vec<PromptRecord> = records.iter().take(5).cloned().collect();
    Ok(Json(UploadResponse {
        success: true,
        message,
        total_prompts: records.len(),
        preview,
        data: records,
    }))
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models = providers::available_models(&state.settings);
    Json(serde_json::json!({
        "models": models,
        "default_model": state.settings.default_model,
    }))
}

fn check_eval_rate_limit(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let client = client_ip(headers);
    if !state.eval_limiter.check(&client) {
        return Err(ApiError::TooManyRequests(
            "Evaluation rate limit exceeded, try again shortly".to_string(),
        ));
    }
    Ok(())
}

fn check_api_rate_limit(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let client = client_ip(headers);
    if !state.api_limiter.check(&client) {
        return Err(ApiError::TooManyRequests(
            "Rate limit exceeded, try again shortly".to_string(),
        ));
    }
    Ok(())
}

async fn evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<EvaluationRequest>,
) -> Result<Json<EvaluationResponse>, ApiError> {
    check_eval_rate_limit(&state, &headers)?;
    if request.model.trim().is_empty() {
        request.model = state.settings.default_model.clone();
    }
    request
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let evaluation_id = Uuid::new_v4().to_string();
    tracing::info!(
        evaluation_id = %evaluation_id,
        prompts = request.prompts.len(),
        model = %request.model,
        "starting evaluation"
    );

    let (results, summary) = state.evaluator.evaluate_batch(&request).await;

    let status = EvaluationStatus {
        evaluation_id: evaluation_id.clone(),
        status: "completed".to_string(),
        total_prompts: request.prompts.len(),
        completed_prompts: results.len(),
        created_at: Utc::now().to_rfc3339(),
    };
    state
        .statuses
        .write()
        .await
        .insert(evaluation_id.clone(), status);
    state
        .results
        .write()
        .await
        .insert(evaluation_id.clone(), results.clone());

    let total_evaluations = results.len();
    Ok(Json(EvaluationResponse {
        success: true,
        message: format!("Evaluated {total_evaluations} prompts"),
        evaluation_id,
        results,
        total_evaluations,
        summary,
    }))
}

#[derive(Debug, Deserialize)]
struct SingleEvaluationRequest {
    prompt: String,
    expected_output: String,
    model: Option<String>,
    #[serde(default)]
    parameters: Option<ModelParameters>,
    #[serde(default)]
    include_advanced_metrics: bool,
}

async fn evaluate_single(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SingleEvaluationRequest>,
) -> Result<Json<EvaluationResult>, ApiError> {
    // Single-prompt runs count against the general limit; batches use the
    // stricter evaluation limit.
    check_api_rate_limit(&state, &headers)?;

    let record = PromptRecord {
        prompt: request.prompt,
        expected_output: request.expected_output,
        metadata: None,
    };
    record
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let params = request.parameters.unwrap_or_default();
    params
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let model = request
        .model
        .unwrap_or_else(|| state.settings.default_model.clone());

    let result = state
        .evaluator
        .evaluate_single(&record, &model, &params, request.include_advanced_metrics)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct DiffRequest {
    expected_output: String,
    model_response: String,
}

/// Positional token comparison between a response and its expected output,
/// for the side-by-side result view.
async fn diff_tokens(Json(request): Json<DiffRequest>) -> Json<serde_json::Value> {
    let entries = crate::metrics::token_diff(&request.expected_output, &request.model_response);
    let matches = entries
        .iter()
        .filter(|e| e.kind == crate::metrics::TokenDiffKind::Match)
        .count();
    Json(serde_json::json!({
        "total_tokens": entries.len(),
        "matches": matches,
        "tokens": entries,
    }))
}

async fn evaluation_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EvaluationStatus>, ApiError> {
    state
        .statuses
        .read()
        .await
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No evaluation with id {id}")))
}

async fn get_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let results = state
        .results
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("No results for evaluation {id}")))?;
    Ok(Json(serde_json::json!({
        "evaluation_id": id,
        "total_results": results.len(),
        "results": results,
    })))
}

async fn delete_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.results.write().await.remove(&id);
    state.statuses.write().await.remove(&id);
    match removed {
        Some(results) => Ok(Json(serde_json::json!({
            "success": true,
            "message": format!("Deleted {} results", results.len()),
        }))),
        None => Err(ApiError::NotFound(format!("No results for evaluation {id}"))),
    }
}

async fn export_results(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Result<Response, ApiError> {
    let results = match request.results {
        Some(results) if !results.is_empty() => results,
        _ => {
            let stored = state.results.read().await;
            let mut all: Vec<EvaluationResult> = stored.values().flatten().cloned().collect();
            all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            all
        }
    };
    if results.is_empty() {
        return Err(ApiError::NotFound(
            "No evaluation results available for export".to_string(),
        ));
    }

    download_response(&results, request.format, request.include_metadata)
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: Option<ExportFormat>,
    #[serde(default)]
    include_metadata: Option<bool>,
}

fn download_response(
    results: &[EvaluationResult],
    format: ExportFormat,
    include_metadata: bool,
) -> Result<Response, ApiError> {
    let (body, content_type) = export::export(results, format, include_metadata)?;
    let filename = export::export_filename(format);
    tracing::info!(filename = %filename, results = results.len(), "exporting results");
    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, body).into_response())
}

/// Download one stored evaluation run, CSV unless told otherwise.
async fn export_evaluation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let results = state
        .results
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("No results for evaluation {id}")))?;
    download_response(
        &results,
        query.format.unwrap_or(ExportFormat::Csv),
        query.include_metadata.unwrap_or(true),
    )
}

async fn export_formats() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "formats": [
            {
                "format": "csv",
                "content_type": "text/csv",
                "description": "Spreadsheet-friendly, fixed column order",
            },
            {
                "format": "json",
                "content_type": "application/json",
                "description": "Full result objects under an export envelope",
            },
        ],
    }))
}

async fn export_summary(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stored = state.results.read().await;
    let all: Vec<EvaluationResult> = stored.values().flatten().cloned().collect();
    let summary = evaluation::summarize(&all, 0.0);
    let date_range = serde_json::json!({
        "from": all.iter().map(|r| r.timestamp.as_str()).min(),
        "to": all.iter().map(|r| r.timestamp.as_str()).max(),
    });
    let toxic_results = all.iter().filter(|r| r.toxicity).count();
    Json(serde_json::json!({
        "stored_evaluations": stored.len(),
        "total_results": all.len(),
        "toxic_results": toxic_results,
        "date_range": date_range,
        "available_formats": ["csv", "json"],
        "max_prompts_per_evaluation": MAX_PROMPTS_PER_EVALUATION,
        "summary": summary,
    }))
}

async fn security_headers(request: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    if settings.allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = settings
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_file_size_bytes() as usize;
    let api = Router::new()
        .route("/upload", post(upload))
        .route("/upload/info", get(upload_info))
        .route("/evaluate", post(evaluate))
        .route("/evaluate/single", post(evaluate_single))
        .route("/evaluate/diff", post(diff_tokens))
        .route("/evaluate/status/{id}", get(evaluation_status))
        .route(
            "/evaluate/results/{id}",
            get(get_results).delete(delete_results),
        )
        .route("/models", get(list_models))
        .route("/export", post(export_results))
        .route("/export/summary", get(export_summary))
        .route("/export/formats", get(export_formats))
        .route("/export/{evaluation_id}", get(export_evaluation));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(middleware::from_fn(security_headers))
        .layer(cors_layer(&state.settings))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
