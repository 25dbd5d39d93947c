//! Filter rule persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use crate::error::StoreError;
use crate::filter::model::{FilterAction, FilterRule, NewFilter};
use crate::store::db::{Storage, opt_text_owned, parse_datetime};

const FILTER_COLUMNS: &str =
    "id, name, action, pattern, replacement, is_regex, is_active, created_at";

/// Map a libsql Row to a FilterRule. Column order matches FILTER_COLUMNS.
///
/// Rows with an action value this build does not know are skipped with a
/// warning, so an older binary keeps working against a newer database.
fn row_to_filter(row: &libsql::Row) -> Result<Option<FilterRule>, libsql::Error> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let action_str: String = row.get(2)?;
    let pattern: String = row.get(3)?;
    let replacement: Option<String> = row.get(4).ok();
    let is_regex: i64 = row.get(5)?;
    let is_active: i64 = row.get(6)?;
    let created_str: String = row.get(7)?;

    let action = match action_str.parse::<FilterAction>() {
        Ok(action) => action,
        Err(e) => {
            tracing::warn!("Skipping filter {name:?}: {e}");
            return Ok(None);
        }
    };

    Ok(Some(FilterRule {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        name,
        action,
        pattern,
        replacement,
        is_regex: is_regex != 0,
        is_active: is_active != 0,
        created_at: parse_datetime(&created_str),
    }))
}

/// Persistence for [`FilterRule`] rows.
pub struct FilterStore {
    storage: Arc<Storage>,
}

impl FilterStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Insert a new rule, active by default. Callers validate the draft
    /// before this point.
    pub async fn create(
        &self,
        new: &NewFilter,
        now: DateTime<Utc>,
    ) -> Result<FilterRule, StoreError> {
        let rule = FilterRule {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            action: new.action,
            pattern: new.pattern.clone(),
            replacement: new.replacement.clone(),
            is_regex: new.is_regex,
            is_active: true,
            created_at: now,
        };

        self.storage
            .conn()
            .execute(
                "INSERT INTO filters (id, name, action, pattern, replacement, is_regex, is_active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rule.id.to_string(),
                    rule.name.clone(),
                    rule.action.as_str(),
                    rule.pattern.clone(),
                    opt_text_owned(rule.replacement.clone()),
                    rule.is_regex as i64,
                    rule.is_active as i64,
                    rule.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("create filter: {e}")))?;

        Ok(rule)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<FilterRule>, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(
                &format!("SELECT {FILTER_COLUMNS} FROM filters WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get filter: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_filter(&row)
                .map_err(|e| StoreError::Query(format!("get filter row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get filter: {e}"))),
        }
    }

    /// Active rules in ascending creation order, ready for the engine.
    pub async fn active_ordered(&self) -> Result<Vec<FilterRule>, StoreError> {
        self.query_filters(&format!(
            "SELECT {FILTER_COLUMNS} FROM filters WHERE is_active = 1 ORDER BY created_at ASC"
        ))
        .await
    }

    /// Every rule, for admin listings.
    pub async fn list_all(&self) -> Result<Vec<FilterRule>, StoreError> {
        self.query_filters(&format!(
            "SELECT {FILTER_COLUMNS} FROM filters ORDER BY created_at ASC"
        ))
        .await
    }

    async fn query_filters(&self, sql: &str) -> Result<Vec<FilterRule>, StoreError> {
        let mut rows = self
            .storage
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| StoreError::Query(format!("list filters: {e}")))?;

        let mut filters = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_filter(&row) {
                Ok(Some(rule)) => filters.push(rule),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping filter row: {e}");
                }
            }
        }
        Ok(filters)
    }

    /// Rewrite a rule's definition, keeping its id, activity, and
    /// creation-order slot.
    pub async fn update(&self, id: Uuid, new: &NewFilter) -> Result<FilterRule, StoreError> {
        let affected = self
            .storage
            .conn()
            .execute(
                "UPDATE filters SET name = ?1, action = ?2, pattern = ?3, replacement = ?4, is_regex = ?5 WHERE id = ?6",
                params![
                    new.name.clone(),
                    new.action.as_str(),
                    new.pattern.clone(),
                    opt_text_owned(new.replacement.clone()),
                    new.is_regex as i64,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update filter: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "filter".to_string(),
                id: id.to_string(),
            });
        }
        self.get(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "filter".to_string(),
            id: id.to_string(),
        })
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let affected = self
            .storage
            .conn()
            .execute(
                "UPDATE filters SET is_active = ?1 WHERE id = ?2",
                params![active as i64, id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set filter active: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "filter".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let affected = self
            .storage
            .conn()
            .execute(
                "DELETE FROM filters WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete filter: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "filter".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
