//! Cached snapshot of active rules and settings.
//!
//! Submissions read this snapshot instead of the database. It can be
//! stale until the next explicit `reload()`, which the relay triggers
//! after every rule or settings mutation.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::filter::model::{FilterRule, Settings};
use crate::store::filters::FilterStore;
use crate::store::settings::SettingsStore;

#[derive(Debug, Default)]
struct Snapshot {
    filters: Vec<FilterRule>,
    settings: Option<Settings>,
}

pub struct FilterRegistry {
    filters: Arc<FilterStore>,
    settings: Arc<SettingsStore>,
    snapshot: RwLock<Snapshot>,
}

impl FilterRegistry {
    /// Start with an empty snapshot; call `reload()` to populate it.
    pub fn new(filters: Arc<FilterStore>, settings: Arc<SettingsStore>) -> Self {
        Self {
            filters,
            settings,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Re-read active rules and settings from the stores.
    pub async fn reload(&self) -> Result<(), StoreError> {
        let filters = self.filters.active_ordered().await?;
        let settings = self.settings.fetch().await?;
        let count = filters.len();

        let mut snapshot = self.snapshot.write().await;
        *snapshot = Snapshot { filters, settings };
        drop(snapshot);

        tracing::debug!(filters = count, "Filter registry reloaded");
        Ok(())
    }

    /// Cached active rules in creation order.
    pub async fn active_filters(&self) -> Vec<FilterRule> {
        self.snapshot.read().await.filters.clone()
    }

    /// Cached settings; None until settings have been saved once.
    pub async fn settings(&self) -> Option<Settings> {
        self.snapshot.read().await.settings
    }

    /// Forget the cached state without touching the stores.
    pub async fn clear(&self) {
        let mut snapshot = self.snapshot.write().await;
        *snapshot = Snapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::filter::model::{FilterAction, NewFilter};
    use crate::store::db::Storage;

    async fn setup() -> (Arc<FilterStore>, Arc<SettingsStore>, FilterRegistry) {
        let storage = Arc::new(Storage::open_memory().await.unwrap());
        let filters = Arc::new(FilterStore::new(storage.clone()));
        let settings = Arc::new(SettingsStore::new(storage));
        let registry = FilterRegistry::new(filters.clone(), settings.clone());
        (filters, settings, registry)
    }

    fn draft(name: &str) -> NewFilter {
        NewFilter {
            name: name.to_string(),
            action: FilterAction::RemoveWord,
            pattern: "x".to_string(),
            replacement: None,
            is_regex: false,
        }
    }

    #[tokio::test]
    async fn starts_empty() {
        let (_, _, registry) = setup().await;
        assert!(registry.active_filters().await.is_empty());
        assert_eq!(registry.settings().await, None);
    }

    #[tokio::test]
    async fn reload_populates_the_snapshot() {
        let (filters, settings, registry) = setup().await;
        filters.create(&draft("one"), Utc::now()).await.unwrap();
        settings
            .upsert(
                Settings {
                    remove_mention: true,
                    remove_url: false,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        registry.reload().await.unwrap();
        assert_eq!(registry.active_filters().await.len(), 1);
        assert_eq!(
            registry.settings().await,
            Some(Settings {
                remove_mention: true,
                remove_url: false,
            })
        );
    }

    #[tokio::test]
    async fn snapshot_is_stale_until_reload() {
        let (filters, _, registry) = setup().await;
        registry.reload().await.unwrap();

        filters.create(&draft("late"), Utc::now()).await.unwrap();
        assert!(registry.active_filters().await.is_empty());

        registry.reload().await.unwrap();
        assert_eq!(registry.active_filters().await.len(), 1);
    }

    #[tokio::test]
    async fn clear_forgets_the_cache_but_not_the_store() {
        let (filters, _, registry) = setup().await;
        filters.create(&draft("kept"), Utc::now()).await.unwrap();
        registry.reload().await.unwrap();
        assert_eq!(registry.active_filters().await.len(), 1);

        registry.clear().await;
        assert!(registry.active_filters().await.is_empty());
        assert_eq!(filters.active_ordered().await.unwrap().len(), 1);
    }
}
