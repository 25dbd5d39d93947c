//! Message ledger. Every submission gets a durable row whose status
//! follows queued -> processing -> sent | failed; a rate-limit pause
//! leaves the status untouched.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::db::{Storage, opt_text_owned, parse_datetime, parse_optional_datetime};

/// Lifecycle state of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Queued,
    Processing,
    Sent,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Queued => "queued",
            RecordStatus::Processing => "processing",
            RecordStatus::Sent => "sent",
            RecordStatus::Failed => "failed",
        }
    }

    /// Sent and failed records never leave their state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Sent | RecordStatus::Failed)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn str_to_status(s: &str) -> RecordStatus {
    match s {
        "processing" => RecordStatus::Processing,
        "sent" => RecordStatus::Sent,
        "failed" => RecordStatus::Failed,
        _ => RecordStatus::Queued,
    }
}

/// One submitted message and its delivery outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub original_text: String,
    pub processed_text: String,
    pub submitter_id: String,
    pub status: RecordStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        original_text: String,
        processed_text: String,
        submitter_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_text,
            processed_text,
            submitter_id,
            status: RecordStatus::Queued,
            sent_at: None,
            error_detail: None,
            created_at: now,
        }
    }
}

const RECORD_COLUMNS: &str =
    "id, original_message, processed_message, user_id, status, sent_at, error, created_at";

/// Map a libsql Row to a MessageRecord. Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<MessageRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(4)?;
    let sent_at_str: Option<String> = row.get(5).ok();
    let created_str: String = row.get(7)?;

    Ok(MessageRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        original_text: row.get(1)?,
        processed_text: row.get(2)?,
        submitter_id: row.get(3)?,
        status: str_to_status(&status_str),
        sent_at: parse_optional_datetime(&sent_at_str),
        error_detail: row.get(6).ok(),
        created_at: parse_datetime(&created_str),
    })
}

/// Persistence for [`MessageRecord`] rows.
pub struct RecordStore {
    storage: Arc<Storage>,
}

impl RecordStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub async fn insert(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.storage
            .conn()
            .execute(
                "INSERT INTO messages (id, original_message, processed_message, user_id, status, sent_at, error, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.original_text.clone(),
                    record.processed_text.clone(),
                    record.submitter_id.clone(),
                    record.status.as_str(),
                    opt_text_owned(record.sent_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(record.error_detail.clone()),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert record: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<MessageRecord>, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_record(&row)
                    .map_err(|e| StoreError::Query(format!("get record row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get record: {e}"))),
        }
    }

    /// Mark a record as being delivered right now.
    pub async fn mark_processing(&self, id: Uuid) -> Result<(), StoreError> {
        self.set_status(id, RecordStatus::Processing, None, None).await
    }

    /// Terminal success: status plus delivery time.
    pub async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_status(id, RecordStatus::Sent, Some(sent_at), None)
            .await
    }

    /// Delivery fault: status plus the error detail. A later successful
    /// attempt may still supersede this.
    pub async fn mark_failed(&self, id: Uuid, detail: &str) -> Result<(), StoreError> {
        self.set_status(id, RecordStatus::Failed, None, Some(detail.to_string()))
            .await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: RecordStatus,
        sent_at: Option<DateTime<Utc>>,
        error_detail: Option<String>,
    ) -> Result<(), StoreError> {
        let affected = self
            .storage
            .conn()
            .execute(
                "UPDATE messages SET status = ?1, sent_at = COALESCE(?2, sent_at), error = COALESCE(?3, error) WHERE id = ?4",
                params![
                    status.as_str(),
                    opt_text_owned(sent_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(error_detail),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update record status: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "message record".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Records newest-first, up to `limit`.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<MessageRecord>, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM messages ORDER BY created_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list recent records: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_record(&row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("Skipping message row: {e}");
                }
            }
        }
        Ok(records)
    }

    /// Delete sent/failed records created before `cutoff`; queued and
    /// processing rows are kept regardless of age. Returns the number of
    /// deleted rows.
    pub async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let affected = self
            .storage
            .conn()
            .execute(
                "DELETE FROM messages WHERE created_at < ?1 AND status IN ('sent', 'failed')",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete old records: {e}")))?;
        Ok(affected)
    }
}
