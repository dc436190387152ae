// Extraction Orchestrator
//
// Sends a stored invoice file to an external vision-inference API with a
// fixed prompt, maps the returned JSON onto ExtractedEntry rows, and drives
// the upload's pending → processing → done/failed lifecycle.
//
// The external boundary is the VisionExtractor trait so tests substitute a
// deterministic fixture instead of a live network call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Deserialize;
use thiserror::Error;

use crate::db::{self, ExtractedEntry, UploadRecord};
use crate::storage::FileStore;

/// Fixed extraction prompt; the model must answer with bare JSON
pub const EXTRACTION_PROMPT: &str = "\
You are reading one credit-card invoice or bank statement image. \
Extract every transaction line you can see and answer with a JSON array only, \
no prose and no markdown. Each element must be an object with keys: \
\"date\" (ISO YYYY-MM-DD), \"description\" (merchant text as printed), \
\"amount\" (number, negative for charges, positive for credits/payments), \
and optionally \"category\" (a short label such as Groceries, Restaurants, \
Transport, Travel, Shopping, Utilities, Health, Entertainment, \
Subscriptions, Salary, Refunds, Transfer). \
If no transactions are visible, answer with [].";

// ============================================================================
// UPSTREAM ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("invalid vision API credential")]
    BadCredential,

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl UpstreamError {
    /// Transient failures are retried with backoff; everything else fails
    /// the upload immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Timeout | UpstreamError::Network(_) => true,
            UpstreamError::Http { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::BadCredential | UpstreamError::Malformed(_) => false,
        }
    }
}

// ============================================================================
// VISION CLIENT
// ============================================================================

/// The external inference boundary. Implementations receive the raw file
/// bytes and the caller-supplied credential and return the model's text.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    async fn extract(
        &self,
        file: &[u8],
        mime_type: &str,
        api_key: &str,
    ) -> Result<String, UpstreamError>;
}

/// Chat-completions client for an OpenAI-compatible vision endpoint.
/// The API key is taken per request and never stored.
pub struct OpenAiVisionClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OpenAiVisionClient {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(OpenAiVisionClient {
            http,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl VisionExtractor for OpenAiVisionClient {
    async fn extract(
        &self,
        file: &[u8],
        mime_type: &str,
        api_key: &str,
    ) -> Result<String, UpstreamError> {
        let data_url = format!("data:{mime_type};base64,{}", BASE64.encode(file));

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": 4096,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": EXTRACTION_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(UpstreamError::BadCredential);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let message = message.chars().take(500).collect();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| UpstreamError::Malformed("response has no message content".into()))
    }
}

// ============================================================================
// RESPONSE PARSING
// ============================================================================

/// One transaction object as the model reports it
#[derive(Debug, Deserialize)]
struct EntryCandidate {
    date: String,
    description: String,
    amount: f64,
    #[serde(default)]
    category: Option<String>,
}

/// Result of mapping the model text onto entries for one upload.
/// Candidates failing validation are counted, not persisted; the batch only
/// fails when nothing survives.
#[derive(Debug)]
pub struct ParsedBatch {
    pub entries: Vec<ExtractedEntry>,
    pub rejected: usize,
}

pub fn parse_model_response(upload_id: &str, text: &str) -> Result<ParsedBatch, UpstreamError> {
    let payload = strip_code_fence(text);

    let candidates: Vec<EntryCandidate> = serde_json::from_str(payload)
        .map_err(|e| UpstreamError::Malformed(format!("not a JSON entry array: {e}")))?;

    let total = candidates.len();
    let mut entries = Vec::with_capacity(total);
    let mut rejected = 0;

    for candidate in candidates {
        match validate_candidate(&candidate) {
            Ok(()) => entries.push(ExtractedEntry::new(
                upload_id,
                candidate.date.trim(),
                candidate.description.trim(),
                candidate.amount,
                candidate
                    .category
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from),
            )),
            Err(reason) => {
                tracing::warn!(upload_id, reason, "dropping invalid entry candidate");
                rejected += 1;
            }
        }
    }

    if entries.is_empty() && rejected > 0 {
        return Err(UpstreamError::Malformed(format!(
            "all {total} entries failed validation"
        )));
    }

    Ok(ParsedBatch { entries, rejected })
}

fn validate_candidate(candidate: &EntryCandidate) -> Result<(), &'static str> {
    if candidate.description.trim().is_empty() {
        return Err("empty description");
    }
    if NaiveDate::parse_from_str(candidate.date.trim(), "%Y-%m-%d").is_err() {
        return Err("unparseable date");
    }
    if !candidate.amount.is_finite() {
        return Err("non-finite amount");
    }
    Ok(())
}

/// Models wrap JSON in a markdown fence despite the prompt; peel it off
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    let rest = rest.trim_end();
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Exponential backoff: base, 2x base, 4x base, ...
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

// ============================================================================
// ORCHESTRATION
// ============================================================================

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("upload record not found: {0}")]
    NotFound(String),

    #[error("upload {id} cannot be processed (status {status})")]
    NotClaimable { id: String, status: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("stored file unreadable: {0}")]
    Storage(String),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub record: UploadRecord,
    pub inserted: usize,
    pub rejected: usize,
}

/// Run one extraction for an upload record.
///
/// Claims the record (`pending`/`failed` → `processing`), calls the vision
/// API with bounded retries for transient failures, then persists the mapped
/// entries together with the `done` transition in a single transaction. Any
/// terminal failure marks the record `failed` with the upstream message.
/// The database lock is never held across an await point.
pub async fn process_upload(
    db: &Arc<Mutex<Connection>>,
    store: &FileStore,
    extractor: &dyn VisionExtractor,
    retry: &RetryPolicy,
    upload_id: &str,
    api_key: &str,
) -> Result<ProcessOutcome, ProcessError> {
    // Claim the lease
    let record = {
        let conn = db.lock().unwrap();
        let record = db::get_upload_record(&conn, upload_id)?
            .ok_or_else(|| ProcessError::NotFound(upload_id.to_string()))?;

        if !db::claim_for_processing(&conn, upload_id)? {
            return Err(ProcessError::NotClaimable {
                id: upload_id.to_string(),
                status: record.status.to_string(),
            });
        }
        record
    };

    tracing::info!(upload_id, file = %record.original_filename, "extraction started");

    let file = match store.load(&record.storage_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            let message = format!("stored file unreadable: {e}");
            let conn = db.lock().unwrap();
            db::fail_upload(&conn, upload_id, &message)?;
            return Err(ProcessError::Storage(e.to_string()));
        }
    };

    // Outbound call, retried with backoff for transient failures only
    let text = match call_with_retries(extractor, retry, &file, &record.mime_type, api_key).await {
        Ok(text) => text,
        Err(e) => {
            let conn = db.lock().unwrap();
            db::fail_upload(&conn, upload_id, &e.to_string())?;
            tracing::warn!(upload_id, error = %e, "extraction failed");
            return Err(e.into());
        }
    };

    let batch = match parse_model_response(upload_id, &text) {
        Ok(batch) => batch,
        Err(e) => {
            let conn = db.lock().unwrap();
            db::fail_upload(&conn, upload_id, &e.to_string())?;
            tracing::warn!(upload_id, error = %e, "model response rejected");
            return Err(e.into());
        }
    };

    let record = {
        let mut conn = db.lock().unwrap();
        db::complete_with_entries(&mut conn, upload_id, &batch.entries)?;
        db::get_upload_record(&conn, upload_id)?
            .ok_or_else(|| anyhow::anyhow!("upload {upload_id} disappeared during completion"))?
    };

    tracing::info!(
        upload_id,
        inserted = batch.entries.len(),
        rejected = batch.rejected,
        "extraction done"
    );

    Ok(ProcessOutcome {
        record,
        inserted: batch.entries.len(),
        rejected: batch.rejected,
    })
}

async fn call_with_retries(
    extractor: &dyn VisionExtractor,
    retry: &RetryPolicy,
    file: &[u8],
    mime_type: &str,
    api_key: &str,
) -> Result<String, UpstreamError> {
    let mut attempt = 1;

    loop {
        match extractor.extract(file, mime_type, api_key).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_transient() && attempt < retry.attempts => {
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = retry.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient upstream failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
