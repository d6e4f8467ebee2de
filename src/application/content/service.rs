use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::application::repos::{AssetStorage, AuthProvider, ContentReader, ContentWriter};
use crate::cache::lock::mutex_lock;
use crate::cache::{DurableStore, ResourcePrefix};
use crate::domain::entities::ContentItem;
use crate::realtime::UpstreamInvalidator;

use super::types::{ClearReport, OrchestratorConfig, RefreshReport, StaticFallback};

const SOURCE: &str = "application::content::service";

/// Read orchestration and write-side invalidation over the backend tiers.
pub struct ContentService {
    pub(crate) reader: Arc<dyn ContentReader>,
    pub(crate) writer: Arc<dyn ContentWriter>,
    pub(crate) storage: Arc<dyn AssetStorage>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) durable: DurableStore,
    pub(crate) config: OrchestratorConfig,
    pub(crate) fallback: StaticFallback,
    /// Primary reads that outlived their deadline and keep warming the caches.
    pub(crate) background: Mutex<Vec<AbortHandle>>,
    pub(crate) asset_removals: Mutex<Vec<AbortHandle>>,
}

impl ContentService {
    pub fn new(
        reader: Arc<dyn ContentReader>,
        writer: Arc<dyn ContentWriter>,
        storage: Arc<dyn AssetStorage>,
        auth: Arc<dyn AuthProvider>,
        durable: DurableStore,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            reader,
            writer,
            storage,
            auth,
            durable,
            config,
            fallback: StaticFallback::default(),
            background: Mutex::new(Vec::new()),
            asset_removals: Mutex::new(Vec::new()),
        }
    }

    pub fn with_static_fallback(mut self, fallback: StaticFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub(crate) fn track(&self, list: &Mutex<Vec<AbortHandle>>, handle: AbortHandle) {
        let mut handles = mutex_lock(list, SOURCE, "track");
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    /// Background primaries and scheduled asset removals still running.
    pub fn pending_tasks(&self) -> usize {
        [&self.background, &self.asset_removals]
            .into_iter()
            .map(|list| {
                mutex_lock(list, SOURCE, "pending_tasks")
                    .iter()
                    .filter(|handle| !handle.is_finished())
                    .count()
            })
            .sum()
    }

    /// Drop every gateway and durable entry, then re-prime the landing
    /// resources.
    pub async fn force_refresh(&self) -> RefreshReport {
        let cleared = self.clear_all_caches().await;
        debug!(
            memory = cleared.memory,
            durable = cleared.durable,
            "Caches cleared before refresh"
        );

        let (featured, items, categories) = tokio::join!(
            self.featured_items(),
            self.all_items(),
            self.categories()
        );
        let report = RefreshReport {
            featured: featured.len(),
            items: items.len(),
            categories: categories.len(),
        };
        info!(
            featured = report.featured,
            items = report.items,
            categories = report.categories,
            "Content caches refreshed"
        );
        report
    }

    pub async fn clear_all_caches(&self) -> ClearReport {
        let memory = self.reader.invalidate(&[ResourcePrefix::All]).await;
        let durable = self.durable.clear(&ResourcePrefix::All).await;
        info!(memory, durable, "All content caches cleared");
        ClearReport { memory, durable }
    }

    /// Drop gateway and durable entries for resources known to be
    /// superseded.
    pub async fn invalidate_resources(&self, prefixes: &[ResourcePrefix]) -> ClearReport {
        let memory = self.reader.invalidate(prefixes).await;
        let mut durable = 0;
        for prefix in prefixes {
            durable += self.durable.clear(prefix).await;
        }
        ClearReport { memory, durable }
    }

    /// Abort background primaries and pending asset removals.
    pub fn dispose(&self) {
        let mut aborted = 0;
        for list in [&self.background, &self.asset_removals] {
            for handle in mutex_lock(list, SOURCE, "dispose").drain(..) {
                if !handle.is_finished() {
                    aborted += 1;
                }
                handle.abort();
            }
        }
        if aborted > 0 {
            warn!(aborted, "Content service disposed with pending background work");
        }
    }
}

impl Drop for ContentService {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[async_trait]
impl UpstreamInvalidator for ContentService {
    async fn invalidate_upstream(&self, prefixes: &[ResourcePrefix]) {
        let report = self.invalidate_resources(prefixes).await;
        debug!(
            memory = report.memory,
            durable = report.durable,
            "Upstream tiers invalidated by change event"
        );
    }

    fn present(&self, item: ContentItem) -> ContentItem {
        self.optimize_owned(item)
    }
}
