//! Source adapter registry, keyed by source id.

use std::collections::HashMap;
use std::sync::Arc;

use bridge_traits::source::{CatalogSource, PageSource, SourceAdapter, SourceId};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Default)]
pub struct SourceRegistry {
    adapters: RwLock<HashMap<SourceId, SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own source id, replacing any previous one.
    pub async fn register(&self, adapter: SourceAdapter) -> Option<SourceAdapter> {
        let source_id = adapter.source_id();
        info!(source_id = %source_id, adapter = ?adapter, "Registering source adapter");
        self.adapters.write().await.insert(source_id, adapter)
    }

    pub async fn register_catalog(&self, source: Arc<dyn CatalogSource>) {
        self.register(SourceAdapter::Metadata(source)).await;
    }

    pub async fn register_page_source(&self, source: Arc<dyn PageSource>) {
        self.register(SourceAdapter::Http(source)).await;
    }

    pub async fn unregister(&self, source_id: &SourceId) -> Option<SourceAdapter> {
        self.adapters.write().await.remove(source_id)
    }

    pub async fn get(&self, source_id: &SourceId) -> Option<SourceAdapter> {
        self.adapters.read().await.get(source_id).cloned()
    }

    pub async fn source_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<_> = self.adapters.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::source::{
        CanonicalBook, CanonicalChapter, ContentPayload, FetchError, FetchResult, SearchPage,
    };

    struct Named(&'static str);

    #[async_trait]
    impl CatalogSource for Named {
        fn source_id(&self) -> SourceId {
            SourceId::new(self.0)
        }

        async fn search(&self, _query: &str, _page: u32) -> FetchResult<SearchPage> {
            Ok(SearchPage::default())
        }

        async fn fetch_detail(&self, key: &str) -> FetchResult<CanonicalBook> {
            Err(FetchError::NotFound(key.to_string()))
        }

        async fn fetch_chapter_list(&self, _key: &str) -> FetchResult<Vec<CanonicalChapter>> {
            Ok(Vec::new())
        }

        async fn fetch_content(&self, key: &str) -> FetchResult<ContentPayload> {
            Err(FetchError::NotFound(key.to_string()))
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = SourceRegistry::new();
        registry.register_catalog(Arc::new(Named("b"))).await;
        registry.register_catalog(Arc::new(Named("a"))).await;

        assert!(registry.get(&SourceId::new("a")).await.is_some());
        assert!(registry.get(&SourceId::new("zzz")).await.is_none());
        assert_eq!(
            registry.source_ids().await,
            vec![SourceId::new("a"), SourceId::new("b")]
        );

        let previous = registry
            .register(SourceAdapter::Metadata(Arc::new(Named("a"))))
            .await;
        assert!(previous.is_some());

        registry.unregister(&SourceId::new("a")).await;
        assert!(registry.get(&SourceId::new("a")).await.is_none());
    }
}
