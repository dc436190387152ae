// Budgetly - Invoice Extraction Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod api;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod extractor;
pub mod storage;

// Re-export commonly used types
pub use api::{router, ApiResponse, AppState, CREDENTIAL_HEADER};
pub use config::Config;
pub use db::{
    claim_for_processing, complete_with_entries, confirm_upload, content_sha256,
    count_uploads_by_status, delete_entry, delete_upload_record, fail_upload,
    find_upload_by_sha256, get_entry, get_upload_record, insert_upload_record, list_categories,
    list_entries, list_upload_records, seed_default_categories, setup_database, update_entry,
    ConfirmOutcome, DeleteOutcome, EntryPatch, ExtractedEntry, UpdateOutcome, UploadRecord,
    UploadStatus,
};
pub use entities::{default_categories, Category, CategoryType};
pub use error::{ApiError, ApiResult};
pub use extractor::{
    parse_model_response, process_upload, OpenAiVisionClient, ProcessError, ProcessOutcome,
    RetryPolicy, UpstreamError, VisionExtractor, EXTRACTION_PROMPT,
};
pub use storage::{FileStore, StorageError, ALLOWED_MIME_TYPES};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
