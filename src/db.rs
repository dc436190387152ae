use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::entities::{default_categories, Category, CategoryType};

// ============================================================================
// UPLOAD STATUS
// ============================================================================

/// Lifecycle of an uploaded invoice. Transitions only move forward:
/// `pending → processing → done` or `failed`. A `failed` record may be
/// re-claimed for another attempt; nothing ever returns to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

#[derive(Debug, Error)]
#[error("unknown upload status: {0}")]
pub struct ParseStatusError(String);

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Processing => "processing",
            UploadStatus::Done => "done",
            UploadStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for UploadStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "processing" => Ok(UploadStatus::Processing),
            "done" => Ok(UploadStatus::Done),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// UPLOAD RECORD
// ============================================================================

/// Metadata row for one uploaded invoice file and its processing status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Stable identity (UUID)
    pub id: String,

    /// Filename as supplied by the client (display only, never a path)
    pub original_filename: String,

    /// Where the bytes live on disk
    pub storage_path: String,

    pub size_bytes: i64,
    pub mime_type: String,

    /// SHA-256 of the file content, for duplicate-upload detection
    pub sha256: String,

    pub status: UploadStatus,

    /// Upstream error message when status is `failed`
    pub error_message: Option<String>,

    /// Set once the user confirms the extracted entries; entries are
    /// immutable from then on
    pub confirmed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(
        original_filename: &str,
        storage_path: &str,
        size_bytes: i64,
        mime_type: &str,
        sha256: &str,
    ) -> Self {
        let now = Utc::now();

        UploadRecord {
            id: uuid::Uuid::new_v4().to_string(),
            original_filename: original_filename.to_string(),
            storage_path: storage_path.to_string(),
            size_bytes,
            mime_type: mime_type.to_string(),
            sha256: sha256.to_string(),
            status: UploadStatus::Pending,
            error_message: None,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

/// Compute the content digest stored on every upload record
pub fn content_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// EXTRACTED ENTRY
// ============================================================================

/// One transaction line derived from an invoice, editable by the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntry {
    /// Stable identity (UUID)
    pub id: String,

    /// Owning upload record (many-to-one, cascade delete)
    pub upload_id: String,

    /// Transaction date as printed on the invoice (ISO `YYYY-MM-DD`)
    pub entry_date: String,

    pub description: String,

    /// Signed amount: negative for charges, positive for credits
    pub amount: f64,

    /// Suggested category label, free to edit
    pub category: Option<String>,

    /// Set when the user has touched this entry
    pub edited: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractedEntry {
    pub fn new(
        upload_id: &str,
        entry_date: &str,
        description: &str,
        amount: f64,
        category: Option<String>,
    ) -> Self {
        let now = Utc::now();

        ExtractedEntry {
            id: uuid::Uuid::new_v4().to_string(),
            upload_id: upload_id.to_string(),
            entry_date: entry_date.to_string(),
            description: description.to_string(),
            amount,
            category,
            edited: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields a user may change on an entry; omitted fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryPatch {
    pub entry_date: Option<String>,
    pub description: Option<String>,
    pub amount: Option<f64>,
    pub category: Option<String>,
}

impl EntryPatch {
    pub fn is_empty(&self) -> bool {
        self.entry_date.is_none()
            && self.description.is_none()
            && self.amount.is_none()
            && self.category.is_none()
    }
}

// ============================================================================
// OPERATION OUTCOMES
// ============================================================================

#[derive(Debug)]
pub enum UpdateOutcome {
    Updated(ExtractedEntry),
    NotFound,
    /// Parent upload is confirmed; entry is immutable
    Confirmed,
}

#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Confirmed,
}

#[derive(Debug)]
pub enum ConfirmOutcome {
    Confirmed(UploadRecord),
    NotFound,
    /// Only `done` uploads can be confirmed
    NotDone(UploadStatus),
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; FK enforcement is off by default in SQLite
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_records (
            id TEXT PRIMARY KEY,
            original_filename TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            mime_type TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            confirmed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS extracted_entries (
            id TEXT PRIMARY KEY,
            upload_id TEXT NOT NULL
                REFERENCES upload_records(id) ON DELETE CASCADE,
            entry_date TEXT NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            category TEXT,
            edited INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            category_type TEXT NOT NULL,
            icon TEXT,
            color TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_status ON upload_records(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_sha256 ON upload_records(sha256)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_upload ON extracted_entries(upload_id)",
        [],
    )?;

    Ok(())
}

/// Insert the default category set; existing names are left alone
pub fn seed_default_categories(conn: &Connection) -> Result<usize> {
    let mut inserted = 0;

    for category in default_categories() {
        let n = conn.execute(
            "INSERT OR IGNORE INTO categories (id, name, category_type, icon, color, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                category.id,
                category.name,
                category.category_type.as_str(),
                category.icon,
                category.color,
                category.created_at.to_rfc3339(),
            ],
        )?;
        inserted += n;
    }

    Ok(inserted)
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn ts_from_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_from_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

const UPLOAD_COLUMNS: &str = "id, original_filename, storage_path, size_bytes, mime_type,
     sha256, status, error_message, confirmed_at, created_at, updated_at";

fn map_upload_row(row: &Row<'_>) -> rusqlite::Result<UploadRecord> {
    let status_str: String = row.get(6)?;
    let status = status_str.parse().map_err(|e: ParseStatusError| {
        rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e))
    })?;

    Ok(UploadRecord {
        id: row.get(0)?,
        original_filename: row.get(1)?,
        storage_path: row.get(2)?,
        size_bytes: row.get(3)?,
        mime_type: row.get(4)?,
        sha256: row.get(5)?,
        status,
        error_message: row.get(7)?,
        confirmed_at: opt_ts_from_column(row, 8)?,
        created_at: ts_from_column(row, 9)?,
        updated_at: ts_from_column(row, 10)?,
    })
}

const ENTRY_COLUMNS: &str = "id, upload_id, entry_date, description, amount, category,
     edited, created_at, updated_at";

fn map_entry_row(row: &Row<'_>) -> rusqlite::Result<ExtractedEntry> {
    Ok(ExtractedEntry {
        id: row.get(0)?,
        upload_id: row.get(1)?,
        entry_date: row.get(2)?,
        description: row.get(3)?,
        amount: row.get(4)?,
        category: row.get(5)?,
        edited: row.get::<_, i64>(6)? != 0,
        created_at: ts_from_column(row, 7)?,
        updated_at: ts_from_column(row, 8)?,
    })
}

// ============================================================================
// UPLOAD RECORD OPERATIONS
// ============================================================================

pub fn insert_upload_record(conn: &Connection, record: &UploadRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO upload_records (
            id, original_filename, storage_path, size_bytes, mime_type,
            sha256, status, error_message, confirmed_at, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.id,
            record.original_filename,
            record.storage_path,
            record.size_bytes,
            record.mime_type,
            record.sha256,
            record.status.as_str(),
            record.error_message,
            record.confirmed_at.map(|dt| dt.to_rfc3339()),
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

pub fn get_upload_record(conn: &Connection, id: &str) -> Result<Option<UploadRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {UPLOAD_COLUMNS} FROM upload_records WHERE id = ?1"
    ))?;

    let mut rows = stmt.query_map(params![id], map_upload_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub fn list_upload_records(conn: &Connection) -> Result<Vec<UploadRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {UPLOAD_COLUMNS} FROM upload_records ORDER BY created_at DESC"
    ))?;

    let records = stmt
        .query_map([], map_upload_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(records)
}

/// Find an earlier upload of the same bytes (idempotent uploads)
pub fn find_upload_by_sha256(conn: &Connection, sha256: &str) -> Result<Option<UploadRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {UPLOAD_COLUMNS} FROM upload_records WHERE sha256 = ?1 LIMIT 1"
    ))?;

    let mut rows = stmt.query_map(params![sha256], map_upload_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// Claim an upload for extraction. The `processing` status acts as a lease:
/// only `pending` and `failed` records can be claimed, so two concurrent
/// extraction requests for the same record cannot both proceed.
pub fn claim_for_processing(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE upload_records
         SET status = 'processing', error_message = NULL, updated_at = ?2
         WHERE id = ?1 AND status IN ('pending', 'failed')",
        params![id, Utc::now().to_rfc3339()],
    )?;

    Ok(changed == 1)
}

/// Persist extracted entries and the `processing → done` transition as one
/// transaction. Fails without side effects if the lease was lost.
pub fn complete_with_entries(
    conn: &mut Connection,
    upload_id: &str,
    entries: &[ExtractedEntry],
) -> Result<usize> {
    let tx = conn.transaction()?;

    let changed = tx.execute(
        "UPDATE upload_records
         SET status = 'done', error_message = NULL, updated_at = ?2
         WHERE id = ?1 AND status = 'processing'",
        params![upload_id, Utc::now().to_rfc3339()],
    )?;

    if changed != 1 {
        anyhow::bail!("upload {upload_id} is not in processing state");
    }

    for entry in entries {
        tx.execute(
            "INSERT INTO extracted_entries (
                id, upload_id, entry_date, description, amount, category,
                edited, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id,
                entry.upload_id,
                entry.entry_date,
                entry.description,
                entry.amount,
                entry.category,
                entry.edited as i64,
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
            ],
        )?;
    }

    tx.commit()?;
    Ok(entries.len())
}

/// Mark a processing upload as failed, keeping the upstream message
pub fn fail_upload(conn: &Connection, id: &str, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE upload_records
         SET status = 'failed', error_message = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'processing'",
        params![id, message, Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

/// Stamp the confirmation timestamp on a `done` upload. Confirming twice is
/// a no-op that returns the already-confirmed record.
pub fn confirm_upload(conn: &Connection, id: &str) -> Result<ConfirmOutcome> {
    let record = match get_upload_record(conn, id)? {
        Some(r) => r,
        None => return Ok(ConfirmOutcome::NotFound),
    };

    if record.is_confirmed() {
        return Ok(ConfirmOutcome::Confirmed(record));
    }

    if record.status != UploadStatus::Done {
        return Ok(ConfirmOutcome::NotDone(record.status));
    }

    conn.execute(
        "UPDATE upload_records SET confirmed_at = ?2, updated_at = ?2 WHERE id = ?1",
        params![id, Utc::now().to_rfc3339()],
    )?;

    let confirmed = get_upload_record(conn, id)?
        .ok_or_else(|| anyhow::anyhow!("upload {id} disappeared during confirm"))?;

    Ok(ConfirmOutcome::Confirmed(confirmed))
}

pub fn delete_upload_record(conn: &Connection, id: &str) -> Result<bool> {
    // Entries cascade via the foreign key
    let changed = conn.execute("DELETE FROM upload_records WHERE id = ?1", params![id])?;
    Ok(changed == 1)
}

/// Count of uploads per status, for the CLI status report
pub fn count_uploads_by_status(conn: &Connection) -> Result<Vec<(UploadStatus, i64)>> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM upload_records GROUP BY status ORDER BY status")?;

    let counts = stmt
        .query_map([], |row| {
            let status_str: String = row.get(0)?;
            let status = status_str.parse().map_err(|e: ParseStatusError| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
            })?;
            Ok((status, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(counts)
}

// ============================================================================
// EXTRACTED ENTRY OPERATIONS
// ============================================================================

pub fn list_entries(conn: &Connection, upload_id: &str) -> Result<Vec<ExtractedEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM extracted_entries
         WHERE upload_id = ?1
         ORDER BY entry_date, created_at"
    ))?;

    let entries = stmt
        .query_map(params![upload_id], map_entry_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn get_entry(conn: &Connection, id: &str) -> Result<Option<ExtractedEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM extracted_entries WHERE id = ?1"
    ))?;

    let mut rows = stmt.query_map(params![id], map_entry_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

fn parent_confirmed(conn: &Connection, entry_id: &str) -> Result<Option<bool>> {
    let mut stmt = conn.prepare(
        "SELECT u.confirmed_at IS NOT NULL
         FROM extracted_entries e
         JOIN upload_records u ON u.id = e.upload_id
         WHERE e.id = ?1",
    )?;

    let mut rows = stmt.query_map(params![entry_id], |row| row.get::<_, bool>(0))?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// Apply a user edit. Rejected once the parent upload is confirmed.
pub fn update_entry(conn: &Connection, id: &str, patch: &EntryPatch) -> Result<UpdateOutcome> {
    match parent_confirmed(conn, id)? {
        None => return Ok(UpdateOutcome::NotFound),
        Some(true) => return Ok(UpdateOutcome::Confirmed),
        Some(false) => {}
    }

    let mut entry = get_entry(conn, id)?
        .ok_or_else(|| anyhow::anyhow!("entry {id} disappeared during update"))?;

    if let Some(date) = &patch.entry_date {
        entry.entry_date = date.clone();
    }
    if let Some(description) = &patch.description {
        entry.description = description.clone();
    }
    if let Some(amount) = patch.amount {
        entry.amount = amount;
    }
    if let Some(category) = &patch.category {
        entry.category = Some(category.clone());
    }
    entry.edited = true;
    entry.updated_at = Utc::now();

    conn.execute(
        "UPDATE extracted_entries
         SET entry_date = ?2, description = ?3, amount = ?4, category = ?5,
             edited = 1, updated_at = ?6
         WHERE id = ?1",
        params![
            entry.id,
            entry.entry_date,
            entry.description,
            entry.amount,
            entry.category,
            entry.updated_at.to_rfc3339(),
        ],
    )?;

    Ok(UpdateOutcome::Updated(entry))
}

/// Delete one entry. Rejected once the parent upload is confirmed.
pub fn delete_entry(conn: &Connection, id: &str) -> Result<DeleteOutcome> {
    match parent_confirmed(conn, id)? {
        None => return Ok(DeleteOutcome::NotFound),
        Some(true) => return Ok(DeleteOutcome::Confirmed),
        Some(false) => {}
    }

    conn.execute("DELETE FROM extracted_entries WHERE id = ?1", params![id])?;
    Ok(DeleteOutcome::Deleted)
}

pub fn count_entries(conn: &Connection, upload_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM extracted_entries WHERE upload_id = ?1",
        params![upload_id],
        |row| row.get(0),
    )?;

    Ok(count)
}

// ============================================================================
// CATEGORY OPERATIONS
// ============================================================================

pub fn list_categories(conn: &Connection) -> Result<Vec<Category>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, category_type, icon, color, created_at
         FROM categories ORDER BY category_type, name",
    )?;

    let categories = stmt
        .query_map([], |row| {
            let type_str: String = row.get(2)?;
            let category_type = CategoryType::parse(&type_str).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    Type::Text,
                    format!("unknown category type: {type_str}").into(),
                )
            })?;

            Ok(Category {
                id: row.get(0)?,
                name: row.get(1)?,
                category_type,
                icon: row.get(3)?,
                color: row.get(4)?,
                created_at: ts_from_column(row, 5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(categories)
}

// ============================================================================
// TESTS
// ============================================================================
