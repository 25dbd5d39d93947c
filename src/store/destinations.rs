//! Delivery destination persistence.
//!
//! At most one destination is active at a time; upserting a chat
//! supersedes whatever was active before it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::db::{Storage, opt_text_owned, parse_datetime};

/// A chat the relay can deliver to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: Uuid,
    pub chat_id: String,
    pub title: Option<String>,
    /// Whether the bot held posting rights when the chat was last verified.
    pub bot_is_admin: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

const DESTINATION_COLUMNS: &str = "id, chat_id, title, bot_is_admin, is_active, created_at";

/// Map a libsql Row to a Destination. Column order matches DESTINATION_COLUMNS.
fn row_to_destination(row: &libsql::Row) -> Result<Destination, libsql::Error> {
    let id_str: String = row.get(0)?;
    let bot_is_admin: i64 = row.get(3)?;
    let is_active: i64 = row.get(4)?;
    let created_str: String = row.get(5)?;

    Ok(Destination {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        chat_id: row.get(1)?,
        title: row.get(2).ok(),
        bot_is_admin: bot_is_admin != 0,
        is_active: is_active != 0,
        created_at: parse_datetime(&created_str),
    })
}

pub struct DestinationStore {
    storage: Arc<Storage>,
}

impl DestinationStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Make `chat_id` the single active destination, recording the admin
    /// flag observed at verification time. A chat seen before keeps its
    /// id. Deactivation and activation run in one transaction, so two
    /// interleaved upserts cannot leave two active rows.
    pub async fn upsert(
        &self,
        chat_id: &str,
        title: Option<&str>,
        bot_is_admin: bool,
        now: DateTime<Utc>,
    ) -> Result<Destination, StoreError> {
        let tx = self
            .storage
            .conn()
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("upsert destination begin: {e}")))?;

        tx.execute("UPDATE destinations SET is_active = 0 WHERE is_active = 1", ())
            .await
            .map_err(|e| StoreError::Query(format!("deactivate destinations: {e}")))?;

        tx.execute(
            "INSERT INTO destinations (id, chat_id, title, bot_is_admin, is_active, created_at) \
             VALUES (?1, ?2, ?3, ?4, 1, ?5) \
             ON CONFLICT(chat_id) DO UPDATE SET \
                 title = excluded.title, \
                 bot_is_admin = excluded.bot_is_admin, \
                 is_active = 1",
            params![
                Uuid::new_v4().to_string(),
                chat_id,
                opt_text_owned(title.map(String::from)),
                bot_is_admin as i64,
                now.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("upsert destination: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("upsert destination commit: {e}")))?;

        self.active().await?.ok_or_else(|| StoreError::NotFound {
            entity: "destination".to_string(),
            id: chat_id.to_string(),
        })
    }

    /// The currently active destination, if any.
    pub async fn active(&self) -> Result<Option<Destination>, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(
                &format!(
                    "SELECT {DESTINATION_COLUMNS} FROM destinations WHERE is_active = 1 LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("get active destination: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let destination = row_to_destination(&row).map_err(|e| {
                    StoreError::Query(format!("destination row parse: {e}"))
                })?;
                Ok(Some(destination))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get active destination: {e}"))),
        }
    }

    /// Deactivate everything. Submissions are refused until a destination
    /// is configured again.
    pub async fn deactivate_all(&self) -> Result<u64, StoreError> {
        self.storage
            .conn()
            .execute("UPDATE destinations SET is_active = 0 WHERE is_active = 1", ())
            .await
            .map_err(|e| StoreError::Query(format!("deactivate destinations: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> DestinationStore {
        DestinationStore::new(Arc::new(Storage::open_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn no_destination_until_configured() {
        let store = test_store().await;
        assert!(store.active().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_activates_the_chat() {
        let store = test_store().await;
        let dest = store
            .upsert("-100123", Some("Announcements"), true, Utc::now())
            .await
            .unwrap();
        assert_eq!(dest.chat_id, "-100123");
        assert_eq!(dest.title.as_deref(), Some("Announcements"));
        assert!(dest.bot_is_admin);
        assert!(dest.is_active);
    }

    #[tokio::test]
    async fn a_new_chat_supersedes_the_previous_one() {
        let store = test_store().await;
        store.upsert("-1", None, true, Utc::now()).await.unwrap();
        let second = store.upsert("-2", None, false, Utc::now()).await.unwrap();

        let active = store.active().await.unwrap().unwrap();
        assert_eq!(active.chat_id, second.chat_id);
        assert_eq!(active.chat_id, "-2");
    }

    #[tokio::test]
    async fn reverifying_a_known_chat_keeps_its_id() {
        let store = test_store().await;
        let first = store.upsert("-1", None, false, Utc::now()).await.unwrap();
        store.upsert("-2", None, true, Utc::now()).await.unwrap();
        let again = store.upsert("-1", Some("named"), true, Utc::now()).await.unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.title.as_deref(), Some("named"));
        assert!(again.bot_is_admin);
    }

    #[tokio::test]
    async fn upserts_never_leave_two_active_rows() {
        let storage = Arc::new(Storage::open_memory().await.unwrap());
        let store = DestinationStore::new(storage.clone());

        for chat in ["-1", "-2", "-1", "-3", "-2"] {
            store.upsert(chat, None, true, Utc::now()).await.unwrap();
        }

        let mut rows = storage
            .conn()
            .query("SELECT COUNT(*) FROM destinations WHERE is_active = 1", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let active_count: i64 = row.get(0).unwrap();
        assert_eq!(active_count, 1);
        assert_eq!(store.active().await.unwrap().unwrap().chat_id, "-2");
    }

    #[tokio::test]
    async fn deactivate_all_clears_the_active_slot() {
        let store = test_store().await;
        store.upsert("-1", None, true, Utc::now()).await.unwrap();
        let cleared = store.deactivate_all().await.unwrap();
        assert_eq!(cleared, 1);
        assert!(store.active().await.unwrap().is_none());
    }
}
