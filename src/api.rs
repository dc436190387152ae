// Review/Confirm API - Axum routes and handlers

use std::sync::{Arc, Mutex};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::db::{
    self, ConfirmOutcome, DeleteOutcome, EntryPatch, ExtractedEntry, UpdateOutcome, UploadRecord,
};
use crate::error::{ApiError, ApiResult};
use crate::extractor::{ProcessError, RetryPolicy, VisionExtractor};
use crate::storage::FileStore;

/// Header carrying the caller-supplied vision API credential. It is used for
/// the one outbound call and never persisted.
pub const CREDENTIAL_HEADER: &str = "x-vision-api-key";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub store: Arc<FileStore>,
    pub extractor: Arc<dyn VisionExtractor>,
    pub retry: RetryPolicy,
}

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

/// Upload record with its entries, for the detail view
#[derive(Serialize)]
struct InvoiceDetail {
    #[serde(flatten)]
    record: UploadRecord,
    entries: Vec<ExtractedEntry>,
}

/// Extraction result summary
#[derive(Serialize)]
struct ProcessSummary {
    #[serde(flatten)]
    record: UploadRecord,
    inserted: usize,
    rejected: usize,
}

pub fn router(state: AppState) -> Router {
    // Multipart framing needs headroom beyond the file limit itself
    let body_limit = state.store.max_bytes() as usize + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/invoices", get(list_invoices))
        .route("/invoices/upload", post(upload_invoice))
        .route("/invoices/:id", get(get_invoice))
        .route("/invoices/:id/process", post(process_invoice))
        .route("/invoices/:id/transactions", get(get_invoice_transactions))
        .route("/invoices/:id/confirm", post(confirm_invoice))
        .route(
            "/transactions/:id",
            put(update_transaction).delete(delete_transaction),
        )
        .route("/categories", get(list_categories))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /invoices/upload - Accept one invoice file (multipart field "file").
/// Bytes are stored before the record is inserted; if the insert fails the
/// file is removed so neither side survives alone.
async fn upload_invoice(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut file_part = None;
    while let Some(candidate) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("malformed multipart body: {e}")))?
    {
        if candidate.name() == Some("file") {
            let filename = candidate.file_name().unwrap_or("upload").to_string();
            let mime_type = candidate
                .content_type()
                .ok_or_else(|| {
                    ApiError::Validation("missing content type on file part".to_string())
                })?
                .to_string();
            let bytes = candidate
                .bytes()
                .await
                .map_err(|e| ApiError::Validation(format!("failed to read upload body: {e}")))?;
            file_part = Some((filename, mime_type, bytes));
            break;
        }
    }
    let (filename, mime_type, bytes) = file_part
        .ok_or_else(|| ApiError::Validation("missing multipart field \"file\"".to_string()))?;

    // Reject before anything touches disk
    state.store.validate(&mime_type, bytes.len() as u64)?;

    let sha256 = db::content_sha256(&bytes);

    // Same bytes uploaded twice resolve to the existing record
    {
        let conn = state.db.lock().unwrap();
        if let Some(existing) = db::find_upload_by_sha256(&conn, &sha256)? {
            tracing::info!(upload_id = %existing.id, "duplicate upload, returning existing record");
            return Ok((StatusCode::OK, Json(ApiResponse::ok(existing))));
        }
    }

    let record_id = uuid::Uuid::new_v4().to_string();
    let path = state.store.store(&record_id, &mime_type, &bytes)?;

    let mut record = UploadRecord::new(
        &filename,
        path.to_str().unwrap_or_default(),
        bytes.len() as i64,
        &mime_type,
        &sha256,
    );
    record.id = record_id;

    let inserted = {
        let conn = state.db.lock().unwrap();
        db::insert_upload_record(&conn, &record)
    };

    if let Err(e) = inserted {
        // No record, no bytes
        let _ = state.store.remove(&path);
        return Err(ApiError::Internal(e));
    }

    tracing::info!(upload_id = %record.id, file = %record.original_filename, "upload accepted");
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(record))))
}

/// POST /invoices/:id/process - Run extraction through the vision API
async fn process_invoice(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let api_key = headers
        .get(CREDENTIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(ApiError::MissingCredential)?
        .to_string();

    let outcome = crate::extractor::process_upload(
        &state.db,
        &state.store,
        state.extractor.as_ref(),
        &state.retry,
        &id,
        &api_key,
    )
    .await
    .map_err(|e| match e {
        ProcessError::NotFound(id) => ApiError::NotFound(format!("upload {id}")),
        ProcessError::NotClaimable { id, status } => ApiError::Conflict(format!(
            "upload {id} cannot be processed (status {status})"
        )),
        ProcessError::Upstream(u) => ApiError::Upstream(u.to_string()),
        ProcessError::Storage(m) => ApiError::Internal(anyhow::anyhow!(m)),
        ProcessError::Db(e) => ApiError::Internal(e),
    })?;

    Ok(Json(ApiResponse::ok(ProcessSummary {
        record: outcome.record,
        inserted: outcome.inserted,
        rejected: outcome.rejected,
    })))
}

/// GET /invoices - List all upload records
async fn list_invoices(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let conn = state.db.lock().unwrap();
    let records = db::list_upload_records(&conn)?;
    Ok(Json(ApiResponse::ok(records)))
}

/// GET /invoices/:id - One upload record with its entries
async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.db.lock().unwrap();

    let record = db::get_upload_record(&conn, &id)?
        .ok_or_else(|| ApiError::NotFound(format!("upload {id}")))?;
    let entries = db::list_entries(&conn, &id)?;

    Ok(Json(ApiResponse::ok(InvoiceDetail { record, entries })))
}

/// GET /invoices/:id/transactions - Entries for one upload
async fn get_invoice_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.db.lock().unwrap();

    if db::get_upload_record(&conn, &id)?.is_none() {
        return Err(ApiError::NotFound(format!("upload {id}")));
    }
    let entries = db::list_entries(&conn, &id)?;

    Ok(Json(ApiResponse::ok(entries)))
}

/// POST /invoices/:id/confirm - Stamp confirmation, freezing the entries
async fn confirm_invoice(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.db.lock().unwrap();

    match db::confirm_upload(&conn, &id)? {
        ConfirmOutcome::Confirmed(record) => Ok(Json(ApiResponse::ok(record))),
        ConfirmOutcome::NotFound => Err(ApiError::NotFound(format!("upload {id}"))),
        ConfirmOutcome::NotDone(status) => Err(ApiError::Conflict(format!(
            "upload {id} is {status}, only done uploads can be confirmed"
        ))),
    }
}

/// PUT /transactions/:id - Edit one entry (sets the edited flag)
async fn update_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<EntryPatch>,
) -> ApiResult<impl IntoResponse> {
    validate_patch(&patch)?;

    let conn = state.db.lock().unwrap();
    match db::update_entry(&conn, &id, &patch)? {
        UpdateOutcome::Updated(entry) => Ok(Json(ApiResponse::ok(entry))),
        UpdateOutcome::NotFound => Err(ApiError::NotFound(format!("transaction {id}"))),
        UpdateOutcome::Confirmed => Err(ApiError::Conflict(
            "parent invoice is confirmed, entries are immutable".to_string(),
        )),
    }
}

/// DELETE /transactions/:id - Remove one entry
async fn delete_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.db.lock().unwrap();

    match db::delete_entry(&conn, &id)? {
        DeleteOutcome::Deleted => Ok(Json(ApiResponse::ok(id))),
        DeleteOutcome::NotFound => Err(ApiError::NotFound(format!("transaction {id}"))),
        DeleteOutcome::Confirmed => Err(ApiError::Conflict(
            "parent invoice is confirmed, entries are immutable".to_string(),
        )),
    }
}

/// GET /categories - Static reference data for the review UI
async fn list_categories(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let conn = state.db.lock().unwrap();
    let categories = db::list_categories(&conn)?;
    Ok(Json(ApiResponse::ok(categories)))
}

fn validate_patch(patch: &EntryPatch) -> ApiResult<()> {
    if patch.is_empty() {
        return Err(ApiError::Validation("empty edit payload".to_string()));
    }
    if let Some(date) = &patch.entry_date {
        if NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").is_err() {
            return Err(ApiError::Validation(format!(
                "invalid entry_date (expected YYYY-MM-DD): {date}"
            )));
        }
    }
    if let Some(description) = &patch.description {
        if description.trim().is_empty() {
            return Err(ApiError::Validation(
                "description must not be empty".to_string(),
            ));
        }
    }
    if let Some(amount) = patch.amount {
        if !amount.is_finite() {
            return Err(ApiError::Validation("amount must be finite".to_string()));
        }
    }
    Ok(())
}
