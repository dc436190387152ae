// End-to-end API tests: upload → process → review/confirm against an
// in-memory database and a scripted vision client.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use rusqlite::Connection;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use budgetly::{
    router, setup_database, AppState, FileStore, RetryPolicy, UpstreamError, VisionExtractor,
    CREDENTIAL_HEADER,
};

const FIXTURE_JSON: &str = r#"[
    {"date": "2024-01-03", "description": "STARBUCKS #4521", "amount": -6.75, "category": "Restaurants"},
    {"date": "2024-01-05", "description": "PAYMENT RECEIVED", "amount": 250.0}
]"#;

/// Scripted stand-in for the vision API: pops one result per call
struct ScriptedVision {
    script: Mutex<VecDeque<Result<String, UpstreamError>>>,
}

impl ScriptedVision {
    fn new(script: Vec<Result<String, UpstreamError>>) -> Self {
        ScriptedVision {
            script: Mutex::new(script.into()),
        }
    }

    fn fixture() -> Self {
        Self::new(vec![Ok(FIXTURE_JSON.to_string())])
    }
}

#[async_trait]
impl VisionExtractor for ScriptedVision {
    async fn extract(
        &self,
        _file: &[u8],
        _mime_type: &str,
        _api_key: &str,
    ) -> Result<String, UpstreamError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(UpstreamError::Timeout))
    }
}

struct TestApp {
    state: AppState,
    // Held so uploaded files outlive each test
    _storage_dir: TempDir,
}

impl TestApp {
    fn new(vision: ScriptedVision) -> Self {
        Self::with_limits(vision, 1024 * 1024, 2)
    }

    fn with_limits(vision: ScriptedVision, max_upload_bytes: u64, retry_attempts: u32) -> Self {
        let storage_dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        budgetly::seed_default_categories(&conn).unwrap();

        let state = AppState {
            db: Arc::new(Mutex::new(conn)),
            store: Arc::new(FileStore::new(storage_dir.path(), max_upload_bytes)),
            extractor: Arc::new(vision),
            retry: RetryPolicy::new(retry_attempts, Duration::from_millis(1)),
        };

        TestApp {
            state,
            _storage_dir: storage_dir,
        }
    }

    fn app(&self) -> Router {
        router(self.state.clone())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn upload(&self, filename: &str, mime: &str, bytes: &[u8]) -> (StatusCode, Value) {
        const BOUNDARY: &str = "budgetly-test-boundary";

        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {mime}\r\n\r\n").as_bytes());
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let request = Request::post("/invoices/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();

        self.send(request).await
    }

    async fn process(&self, id: &str, key: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::post(format!("/invoices/{id}/process"));
        if let Some(key) = key {
            builder = builder.header(CREDENTIAL_HEADER, key);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Upload the fixture invoice and run extraction; returns the upload id
    async fn uploaded_and_processed(&self) -> String {
        let (status, body) = self.upload("invoice.png", "image/png", b"fake png").await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = self.process(&id, Some("sk-test")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["inserted"], 2);

        id
    }

    async fn entry_ids(&self, upload_id: &str) -> Vec<String> {
        let (status, body) = self.get(&format!("/invoices/{upload_id}/transactions")).await;
        assert_eq!(status, StatusCode::OK);
        body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap().to_string())
            .collect()
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new(ScriptedVision::fixture());
    let (status, body) = app.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_upload_creates_pending_record() {
    let app = TestApp::new(ScriptedVision::fixture());

    let (status, body) = app.upload("jan.png", "image/png", b"png bytes").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["original_filename"], "jan.png");

    let (status, body) = app.get("/invoices").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_rejects_disallowed_type_with_no_side_effects() {
    let app = TestApp::new(ScriptedVision::fixture());

    let (status, body) = app.upload("evil.html", "text/html", b"<html>").await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["success"], false);

    // No record, no bytes
    let (_, body) = app.get("/invoices").await;
    assert!(body["data"].as_array().unwrap().is_empty());
    assert!(std::fs::read_dir(app._storage_dir.path())
        .unwrap()
        .next()
        .is_none());
}

#[tokio::test]
async fn test_upload_rejects_oversize() {
    let app = TestApp::with_limits(ScriptedVision::fixture(), 8, 2);

    let (status, _) = app
        .upload("big.png", "image/png", b"way more than eight bytes")
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (_, body) = app.get("/invoices").await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_upload_returns_existing_record() {
    let app = TestApp::new(ScriptedVision::fixture());

    let (status, first) = app.upload("a.png", "image/png", b"same bytes").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, second) = app.upload("b.png", "image/png", b"same bytes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["id"], first["data"]["id"]);

    let (_, body) = app.get("/invoices").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_process_requires_credential() {
    let app = TestApp::new(ScriptedVision::fixture());

    let (status, body) = app.upload("jan.png", "image/png", b"png").await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app.process(&id, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    // Still pending, untouched
    let (_, body) = app.get(&format!("/invoices/{id}")).await;
    assert_eq!(body["data"]["status"], "pending");
}

#[tokio::test]
async fn test_process_yields_exactly_the_mock_entries() {
    let app = TestApp::new(ScriptedVision::fixture());
    let id = app.uploaded_and_processed().await;

    let (status, body) = app.get(&format!("/invoices/{id}/transactions")).await;
    assert_eq!(status, StatusCode::OK);

    let entries = body["data"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["description"], "STARBUCKS #4521");
    assert_eq!(entries[0]["amount"], -6.75);
    assert_eq!(entries[0]["category"], "Restaurants");
    assert_eq!(entries[1]["amount"], 250.0);
    for entry in entries {
        assert_eq!(entry["edited"], false);
        assert_eq!(entry["upload_id"], id.as_str());
    }

    let (_, body) = app.get(&format!("/invoices/{id}")).await;
    assert_eq!(body["data"]["status"], "done");
}

#[tokio::test]
async fn test_process_twice_conflicts() {
    let app = TestApp::new(ScriptedVision::fixture());
    let id = app.uploaded_and_processed().await;

    let (status, body) = app.process(&id, Some("sk-test")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_upstream_timeout_exhausts_budget_and_fails_record() {
    let app = TestApp::with_limits(
        ScriptedVision::new(vec![
            Err(UpstreamError::Timeout),
            Err(UpstreamError::Timeout),
            Err(UpstreamError::Timeout),
        ]),
        1024 * 1024,
        2,
    );

    let (status, body) = app.upload("jan.png", "image/png", b"png").await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app.process(&id, Some("sk-test")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);

    let (_, body) = app.get(&format!("/invoices/{id}")).await;
    assert_eq!(body["data"]["status"], "failed");
    assert!(body["data"]["error_message"]
        .as_str()
        .unwrap()
        .contains("timed out"));
    assert!(body["data"]["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_edit_entry_sets_edited_flag() {
    let app = TestApp::new(ScriptedVision::fixture());
    let id = app.uploaded_and_processed().await;
    let entry_id = app.entry_ids(&id).await.remove(0);

    let request = Request::put(format!("/transactions/{entry_id}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            r#"{"description": "STARBUCKS RESERVE", "amount": -8.25}"#,
        ))
        .unwrap();
    let (status, body) = app.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["description"], "STARBUCKS RESERVE");
    assert_eq!(body["data"]["amount"], -8.25);
    assert_eq!(body["data"]["edited"], true);
}

#[tokio::test]
async fn test_edit_rejects_bad_payload() {
    let app = TestApp::new(ScriptedVision::fixture());
    let id = app.uploaded_and_processed().await;
    let entry_id = app.entry_ids(&id).await.remove(0);

    let request = Request::put(format!("/transactions/{entry_id}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"entry_date": "01/03/2024"}"#))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::put(format!("/transactions/{entry_id}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_confirm_freezes_entries() {
    let app = TestApp::new(ScriptedVision::fixture());
    let id = app.uploaded_and_processed().await;
    let entry_id = app.entry_ids(&id).await.remove(0);

    let (status, body) = app
        .send(
            Request::post(format!("/invoices/{id}/confirm"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["confirmed_at"].is_string());

    // Edits and deletes are rejected from now on
    let request = Request::put(format!("/transactions/{entry_id}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"amount": 0.0}"#))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .send(
            Request::delete(format!("/transactions/{entry_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Both entries still there
    assert_eq!(app.entry_ids(&id).await.len(), 2);
}

#[tokio::test]
async fn test_confirm_requires_done_record() {
    let app = TestApp::new(ScriptedVision::fixture());

    let (_, body) = app.upload("jan.png", "image/png", b"png").await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .send(
            Request::post(format!("/invoices/{id}/confirm"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_delete_entry_before_confirm() {
    let app = TestApp::new(ScriptedVision::fixture());
    let id = app.uploaded_and_processed().await;
    let entry_id = app.entry_ids(&id).await.remove(0);

    let (status, _) = app
        .send(
            Request::delete(format!("/transactions/{entry_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.entry_ids(&id).await.len(), 1);
}

#[tokio::test]
async fn test_not_found_routes() {
    let app = TestApp::new(ScriptedVision::fixture());

    let (status, _) = app.get("/invoices/no-such-id").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.get("/invoices/no-such-id/transactions").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.process("no-such-id", Some("sk-test")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_categories_seeded() {
    let app = TestApp::new(ScriptedVision::fixture());

    let (status, body) = app.get("/categories").await;
    assert_eq!(status, StatusCode::OK);

    let categories = body["data"].as_array().unwrap();
    assert!(!categories.is_empty());
    assert!(categories
        .iter()
        .any(|c| c["name"] == "Groceries" && c["category_type"] == "Expense"));
}
