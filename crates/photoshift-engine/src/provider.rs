use std::collections::{BTreeMap, HashMap};
use std::env;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use photoshift_contracts::errors::{ProviderError, ProviderErrorKind};
use photoshift_contracts::jobs::{ImageRef, JobHandle, JobId};
use photoshift_contracts::operations::OperationKind;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::storage::ImageBytes;

#[derive(Debug, Clone)]
pub struct ProviderSubmitRequest {
    pub job_id: JobId,
    pub prompt: String,
    pub operation: OperationKind,
    pub source_ref: ImageRef,
    pub source_image: ImageBytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Immediate(ImageRef),
    Processing(JobHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubmission {
    pub outcome: SubmitOutcome,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Processing,
    Completed(ImageRef),
    Failed(String),
}

/// Remote image-generation capability. Implementations never retry; retry and
/// fallback policy belongs to the orchestrator.
pub trait TransformationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn submit(&self, request: &ProviderSubmitRequest) -> Result<ProviderSubmission, ProviderError>;
    fn query_status(&self, handle: &JobHandle) -> Result<RemoteStatus, ProviderError>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn TransformationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: TransformationProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TransformationProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(DryrunProvider::new());
    providers.register(ReplicateProvider::new());
    providers
}

/// Offline provider. Results are derived from the job id and prompt; with a
/// latency of `n` polls, jobs resolve on the `n`-th status query.
pub struct DryrunProvider {
    polls_until_done: u32,
    pending: Mutex<HashMap<String, (u32, ImageRef)>>,
}

impl DryrunProvider {
    pub fn new() -> Self {
        Self::with_latency(0)
    }

    pub fn with_latency(polls_until_done: u32) -> Self {
        Self {
            polls_until_done,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for DryrunProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformationProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn submit(&self, request: &ProviderSubmitRequest) -> Result<ProviderSubmission, ProviderError> {
        let digest = short_id(&[request.job_id.as_str(), request.prompt.as_str()]);
        let result = ImageRef::new(format!("dryrun://{}/{}.png", request.operation, digest));
        let provider_request = map_object(json!({
            "endpoint": "dryrun-native",
            "payload": {
                "prompt": request.prompt,
                "operation": request.operation,
                "source": request.source_ref,
                "image_bytes": request.source_image.bytes.len(),
            }
        }));

        if self.polls_until_done == 0 {
            return Ok(ProviderSubmission {
                outcome: SubmitOutcome::Immediate(result.clone()),
                provider_request,
                provider_response: map_object(json!({"status": "succeeded", "output": result})),
            });
        }

        let handle = JobHandle::new(format!("dryrun-{digest}"));
        self.pending
            .lock()
            .map_err(|_| {
                ProviderError::new(ProviderErrorKind::Unknown, self.name(), "dryrun state poisoned")
            })?
            .insert(handle.as_str().to_string(), (self.polls_until_done, result));
        Ok(ProviderSubmission {
            outcome: SubmitOutcome::Processing(handle.clone()),
            provider_request,
            provider_response: map_object(json!({"status": "processing", "id": handle})),
        })
    }

    fn query_status(&self, handle: &JobHandle) -> Result<RemoteStatus, ProviderError> {
        let mut pending = self.pending.lock().map_err(|_| {
            ProviderError::new(ProviderErrorKind::Unknown, self.name(), "dryrun state poisoned")
        })?;
        let Some((remaining, result)) = pending.get_mut(handle.as_str()) else {
            return Err(ProviderError::new(
                ProviderErrorKind::Unknown,
                "dryrun",
                format!("unknown handle {handle}"),
            ));
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return Ok(RemoteStatus::Processing);
        }
        let result = result.clone();
        pending.remove(handle.as_str());
        Ok(RemoteStatus::Completed(result))
    }
}

pub struct ReplicateProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl ReplicateProvider {
    const NAME: &'static str = "replicate";

    pub fn new() -> Self {
        Self {
            api_base: env::var("REPLICATE_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.replicate.com/v1".to_string()),
            api_key: non_empty_env("REPLICATE_API_TOKEN")
                .or_else(|| non_empty_env("REPLICATE_API_KEY")),
            model: non_empty_env("REPLICATE_MODEL")
                .unwrap_or_else(|| "black-forest-labs/flux-kontext-pro".to_string()),
            http: HttpClient::new(),
        }
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::AuthenticationFailed,
                Self::NAME,
                "REPLICATE_API_TOKEN not set",
            )
        })
    }

    fn error(kind: ProviderErrorKind, message: impl Into<String>) -> ProviderError {
        ProviderError::new(kind, Self::NAME, message)
    }

    fn prediction_status(prediction: &Value) -> String {
        prediction
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default()
    }

    fn prediction_error(prediction: &Value) -> String {
        prediction
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| truncate_text(&prediction.to_string(), 512))
    }

    fn first_output_url(prediction: &Value) -> Option<ImageRef> {
        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            extract_output_urls(output, &mut urls);
        }
        urls.into_iter().next().map(ImageRef::new)
    }
}

impl Default for ReplicateProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformationProvider for ReplicateProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn submit(&self, request: &ProviderSubmitRequest) -> Result<ProviderSubmission, ProviderError> {
        let api_key = self.api_key()?;
        let endpoint = self.predictions_endpoint();
        let mime = request
            .source_image
            .mime_type
            .as_deref()
            .unwrap_or("image/png");
        let input_image = format!(
            "data:{mime};base64,{}",
            BASE64.encode(&request.source_image.bytes)
        );
        let payload = map_object(json!({
            "model": self.model,
            "input": {
                "prompt": request.prompt,
                "input_image": input_image,
                "output_format": "png",
            },
        }));

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header("Prefer", "wait")
            .json(&Value::Object(payload.clone()))
            .send()
            .map_err(|err| Self::error(classify_transport_error(&err), err.to_string()))?;
        let prediction = response_json_or_error(Self::NAME, response)?;
        let status = Self::prediction_status(&prediction);

        let outcome = match status.as_str() {
            "succeeded" => SubmitOutcome::Immediate(Self::first_output_url(&prediction).ok_or_else(
                || Self::error(ProviderErrorKind::Unknown, "prediction returned no image URLs"),
            )?),
            "starting" | "processing" => {
                let id = prediction
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        Self::error(ProviderErrorKind::Unknown, "prediction missing id")
                    })?;
                SubmitOutcome::Processing(JobHandle::new(id))
            }
            _ => {
                let message = Self::prediction_error(&prediction);
                return Err(Self::error(classify_failure_message(&message), message));
            }
        };

        Ok(ProviderSubmission {
            outcome,
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: map_object(json!({
                "prediction_id": prediction.get("id").cloned().unwrap_or(Value::Null),
                "status": status,
            })),
        })
    }

    fn query_status(&self, handle: &JobHandle) -> Result<RemoteStatus, ProviderError> {
        let api_key = self.api_key()?;
        let poll_url = format!("{}/{}", self.predictions_endpoint(), handle);
        let response = self
            .http
            .get(&poll_url)
            .bearer_auth(api_key)
            .send()
            .map_err(|err| Self::error(classify_transport_error(&err), err.to_string()))?;
        let prediction = response_json_or_error(Self::NAME, response)?;
        match Self::prediction_status(&prediction).as_str() {
            "succeeded" => Ok(Self::first_output_url(&prediction)
                .map(RemoteStatus::Completed)
                .unwrap_or_else(|| {
                    RemoteStatus::Failed("prediction returned no image URLs".to_string())
                })),
            "failed" | "canceled" => Ok(RemoteStatus::Failed(Self::prediction_error(&prediction))),
            _ => Ok(RemoteStatus::Processing),
        }
    }
}

pub(crate) fn classify_http_failure(code: u16, body: &str) -> ProviderErrorKind {
    match code {
        401 | 403 => ProviderErrorKind::AuthenticationFailed,
        429 => ProviderErrorKind::RateLimited,
        _ if mentions_content_safety(body) => ProviderErrorKind::ContentSafetyRejected,
        408 | 500..=599 => ProviderErrorKind::Unavailable,
        _ => ProviderErrorKind::Unknown,
    }
}

pub(crate) fn classify_failure_message(message: &str) -> ProviderErrorKind {
    if mentions_content_safety(message) {
        ProviderErrorKind::ContentSafetyRejected
    } else {
        ProviderErrorKind::Unknown
    }
}

fn classify_transport_error(err: &reqwest::Error) -> ProviderErrorKind {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderErrorKind::Unavailable
    } else {
        ProviderErrorKind::Unknown
    }
}

fn mentions_content_safety(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    ["nsfw", "safety", "content policy", "moderation", "flagged"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value, ProviderError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Unavailable,
            provider,
            format!("response body read failed: {err}"),
        )
    })?;
    if !status.is_success() {
        return Err(ProviderError::new(
            classify_http_failure(code, &body),
            provider,
            format!("request failed ({code}): {}", truncate_text(&body, 512)),
        ));
    }
    serde_json::from_str(&body).map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Unknown,
            provider,
            format!("invalid JSON payload: {err}"),
        )
    })
}

fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty()
                && trimmed.starts_with("http")
                && !out.iter().any(|existing| existing == trimmed)
            {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "output"] {
                if let Some(nested) = obj.get(key) {
                    extract_output_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn short_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..6])
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use photoshift_contracts::errors::ProviderErrorKind;
    use photoshift_contracts::jobs::{ImageRef, JobHandle, JobId};
    use photoshift_contracts::operations::OperationKind;
    use serde_json::json;

    use super::{
        classify_failure_message, classify_http_failure, default_provider_registry,
        extract_output_urls, DryrunProvider, ProviderSubmitRequest, RemoteStatus,
        ReplicateProvider, SubmitOutcome, TransformationProvider,
    };
    use crate::storage::ImageBytes;

    fn request(job_id: &str) -> ProviderSubmitRequest {
        ProviderSubmitRequest {
            job_id: JobId::from(job_id),
            prompt: "soft window light".to_string(),
            operation: OperationKind::EnhanceLighting,
            source_ref: ImageRef::new("chair.png"),
            source_image: ImageBytes {
                bytes: b"png".to_vec(),
                mime_type: Some("image/png".to_string()),
            },
        }
    }

    #[test]
    fn default_registry_lists_providers_sorted() {
        let registry = default_provider_registry();
        assert_eq!(registry.names(), vec!["dryrun", "replicate"]);
        assert!(registry.get("dryrun").is_some());
        assert!(registry.get("stability").is_none());
    }

    #[test]
    fn dryrun_immediate_results_are_stable_per_job() -> anyhow::Result<()> {
        let provider = DryrunProvider::new();
        let first = provider.submit(&request("job-1"))?;
        let again = provider.submit(&request("job-1"))?;
        let other = provider.submit(&request("job-2"))?;
        assert_eq!(first.outcome, again.outcome);
        assert_ne!(first.outcome, other.outcome);
        match first.outcome {
            SubmitOutcome::Immediate(result) => {
                assert!(result.as_str().starts_with("dryrun://enhance-lighting/"));
            }
            SubmitOutcome::Processing(_) => anyhow::bail!("expected immediate result"),
        }
        assert_eq!(first.provider_request["payload"]["image_bytes"], json!(3));
        Ok(())
    }

    #[test]
    fn dryrun_latency_resolves_on_nth_query() -> anyhow::Result<()> {
        let provider = DryrunProvider::with_latency(3);
        let SubmitOutcome::Processing(handle) = provider.submit(&request("job-1"))?.outcome else {
            anyhow::bail!("expected processing handle");
        };
        assert_eq!(provider.query_status(&handle)?, RemoteStatus::Processing);
        assert_eq!(provider.query_status(&handle)?, RemoteStatus::Processing);
        assert!(matches!(
            provider.query_status(&handle)?,
            RemoteStatus::Completed(_)
        ));
        let err = provider.query_status(&handle).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unknown);
        Ok(())
    }

    #[test]
    fn replicate_without_token_reports_authentication_failure() {
        let provider = ReplicateProvider {
            api_base: "http://127.0.0.1:9".to_string(),
            api_key: None,
            model: "test/model".to_string(),
            http: reqwest::blocking::Client::new(),
        };
        let err = provider.submit(&request("job-1")).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::AuthenticationFailed);
        let err = provider.query_status(&JobHandle::new("p-1")).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::AuthenticationFailed);
    }

    #[test]
    fn http_failures_map_to_provider_error_kinds() {
        assert_eq!(
            classify_http_failure(401, ""),
            ProviderErrorKind::AuthenticationFailed
        );
        assert_eq!(
            classify_http_failure(403, "nsfw"),
            ProviderErrorKind::AuthenticationFailed
        );
        assert_eq!(classify_http_failure(429, ""), ProviderErrorKind::RateLimited);
        assert_eq!(
            classify_http_failure(422, "{\"detail\":\"Input flagged by safety filter\"}"),
            ProviderErrorKind::ContentSafetyRejected
        );
        assert_eq!(classify_http_failure(503, ""), ProviderErrorKind::Unavailable);
        assert_eq!(classify_http_failure(408, ""), ProviderErrorKind::Unavailable);
        assert_eq!(classify_http_failure(400, "bad size"), ProviderErrorKind::Unknown);
    }

    #[test]
    fn failed_predictions_classify_safety_messages() {
        assert_eq!(
            classify_failure_message("NSFW content detected"),
            ProviderErrorKind::ContentSafetyRejected
        );
        assert_eq!(
            classify_failure_message("CUDA out of memory"),
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn output_urls_are_collected_from_nested_payloads() {
        let mut urls = Vec::new();
        extract_output_urls(
            &json!([
                "https://cdn.example/a.png",
                {"url": "https://cdn.example/b.png"},
                {"output": ["https://cdn.example/a.png", "not-a-url"]}
            ]),
            &mut urls,
        );
        assert_eq!(
            urls,
            vec!["https://cdn.example/a.png", "https://cdn.example/b.png"]
        );
    }
}
