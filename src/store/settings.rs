//! Chat-settings singleton persistence. One row, absent until first write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::params;

use crate::error::StoreError;
use crate::filter::model::Settings;
use crate::store::db::Storage;

pub struct SettingsStore {
    storage: Arc<Storage>,
}

impl SettingsStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// The singleton row, or None until the first upsert.
    pub async fn fetch(&self) -> Result<Option<Settings>, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query("SELECT remove_mention, remove_url FROM settings WHERE id = 1", ())
            .await
            .map_err(|e| StoreError::Query(format!("fetch settings: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let remove_mention: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("settings row parse: {e}")))?;
                let remove_url: i64 = row
                    .get(1)
                    .map_err(|e| StoreError::Query(format!("settings row parse: {e}")))?;
                Ok(Some(Settings {
                    remove_mention: remove_mention != 0,
                    remove_url: remove_url != 0,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("fetch settings: {e}"))),
        }
    }

    pub async fn upsert(&self, settings: Settings, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.storage
            .conn()
            .execute(
                "INSERT INTO settings (id, remove_mention, remove_url, updated_at) \
                 VALUES (1, ?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET \
                     remove_mention = excluded.remove_mention, \
                     remove_url = excluded.remove_url, \
                     updated_at = excluded.updated_at",
                params![
                    settings.remove_mention as i64,
                    settings.remove_url as i64,
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert settings: {e}")))?;
        Ok(())
    }
}
