#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use paddock::application::content::{ContentService, OrchestratorConfig};
use paddock::application::repos::{
    AssetStorage, ContentReader, ContentWriter, Fetched, ImageTransform, Payload, Principal,
    RepoError, Role,
};
use paddock::cache::{
    DurableConfig, DurableStore, Freshness, MemoryBackend, ResourceKey, ResourcePrefix,
};
use paddock::domain::categories::fallback_taxonomy;
use paddock::domain::entities::{Category, CategoryInput, ContentItem, ItemChanges, ItemInput};
use paddock::infra::auth::StaticAuth;

pub fn item(id: i64, category: &str) -> ContentItem {
    ContentItem {
        id,
        slug: format!("item-{id}"),
        title: format!("Item {id}"),
        category: category.to_string(),
        content: "Body".to_string(),
        published: true,
        ..Default::default()
    }
}

pub fn editor() -> Principal {
    Principal {
        user_id: "editor-1".to_string(),
        role: Role::Editor,
        access_token: Some("token".to_string()),
    }
}

/// In-memory backend standing in for the REST gateway. Reads always go to the
/// rows; there is no memory tier.
#[derive(Default)]
pub struct FakeBackend {
    pub rows: Mutex<Vec<ContentItem>>,
    pub categories: Mutex<Vec<Category>>,
    pub failing: AtomicBool,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub invalidations: Mutex<Vec<ResourcePrefix>>,
}

impl FakeBackend {
    pub fn with_rows(rows: Vec<ContentItem>) -> Arc<Self> {
        let backend = Self::default();
        *backend.rows.lock().unwrap() = rows;
        *backend.categories.lock().unwrap() = fallback_taxonomy();
        Arc::new(backend)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn visible(&self, filter: impl Fn(&ContentItem) -> bool) -> Arc<Vec<ContentItem>> {
        let rows = self.rows.lock().unwrap();
        Arc::new(
            rows.iter()
                .filter(|item| item.is_public() && filter(item))
                .cloned()
                .collect(),
        )
    }
}

#[async_trait]
impl ContentReader for FakeBackend {
    async fn fetch(&self, key: &ResourceKey) -> Result<Fetched, RepoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepoError::transport("connection refused"));
        }
        let payload = match key {
            ResourceKey::Featured => Payload::Items(self.visible(|item| item.trending)),
            ResourceKey::Items => Payload::Items(self.visible(|_| true)),
            ResourceKey::ItemsByCategory(category) => {
                Payload::Items(self.visible(|item| &item.category == category))
            }
            ResourceKey::Search(query) => Payload::Items(
                self.visible(|item| item.title.to_lowercase().contains(query.as_str())),
            ),
            ResourceKey::ItemById(id) => match self.visible(|item| item.id == *id).first() {
                Some(item) => Payload::Item(Arc::new(item.clone())),
                None => return Err(RepoError::NotFound),
            },
            ResourceKey::Categories => {
                Payload::Categories(Arc::new(self.categories.lock().unwrap().clone()))
            }
        };
        Ok(Fetched {
            payload,
            freshness: Freshness::Fetched,
        })
    }

    async fn invalidate(&self, prefixes: &[ResourcePrefix]) -> usize {
        self.invalidations
            .lock()
            .unwrap()
            .extend(prefixes.iter().cloned());
        0
    }
}

#[async_trait]
impl ContentWriter for FakeBackend {
    async fn load_item(
        &self,
        _actor: &Principal,
        id: i64,
    ) -> Result<Option<ContentItem>, RepoError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|item| item.id == id)
            .cloned())
    }

    async fn list_items(&self, _actor: &Principal) -> Result<Vec<ContentItem>, RepoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap().clone();
        rows.reverse();
        Ok(rows)
    }

    async fn insert_item(
        &self,
        _actor: &Principal,
        input: &ItemInput,
    ) -> Result<ContentItem, RepoError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        let id = rows.iter().map(|item| item.id).max().unwrap_or(0) + 1;
        let created = ContentItem {
            id,
            slug: input.slug.clone().unwrap_or_default(),
            title: input.title.clone(),
            category: input.category.clone(),
            content: input.content.clone(),
            image_url: input.image_url.clone(),
            image_path: input.image_path.clone(),
            published: input.published,
            trending: input.trending,
            ..Default::default()
        };
        rows.push(created.clone());
        Ok(created)
    }

    async fn update_item(
        &self,
        _actor: &Principal,
        id: i64,
        changes: &ItemChanges,
    ) -> Result<ContentItem, RepoError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(RepoError::NotFound)?;
        *row = changes.apply_to(row);
        Ok(row.clone())
    }

    async fn delete_item(&self, _actor: &Principal, id: i64) -> Result<ContentItem, RepoError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        let index = rows
            .iter()
            .position(|item| item.id == id)
            .ok_or(RepoError::NotFound)?;
        Ok(rows.remove(index))
    }

    async fn insert_category(
        &self,
        _actor: &Principal,
        input: &CategoryInput,
    ) -> Result<Category, RepoError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let created = Category {
            id: input.id.clone(),
            name: input.name.clone(),
            level: input.level,
            parent_id: input.parent_id.clone(),
            color: input.color.clone(),
            icon: input.icon.clone(),
            post_count: 0,
            is_active: input.is_active,
        };
        self.categories.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn update_category(
        &self,
        _actor: &Principal,
        id: &str,
        input: &CategoryInput,
    ) -> Result<Category, RepoError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut categories = self.categories.lock().unwrap();
        let category = categories
            .iter_mut()
            .find(|category| category.id == id)
            .ok_or(RepoError::NotFound)?;
        category.name = input.name.clone();
        category.color = input.color.clone();
        category.icon = input.icon.clone();
        category.is_active = input.is_active;
        Ok(category.clone())
    }

    async fn delete_category(&self, _actor: &Principal, id: &str) -> Result<Category, RepoError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut categories = self.categories.lock().unwrap();
        let index = categories
            .iter()
            .position(|category| category.id == id)
            .ok_or(RepoError::NotFound)?;
        Ok(categories.remove(index))
    }
}

/// Storage that renders predictable URLs and records removals.
#[derive(Default)]
pub struct FakeStorage {
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl AssetStorage for FakeStorage {
    async fn remove(&self, path: &str) -> Result<(), RepoError> {
        self.removed.lock().unwrap().push(path.to_string());
        Ok(())
    }

    fn public_url(&self, path: &str, transform: &ImageTransform) -> String {
        format!("https://cdn.test/{path}?width={}", transform.width)
    }
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub storage: Arc<FakeStorage>,
    pub durable: DurableStore,
    pub content: Arc<ContentService>,
}

pub fn harness(rows: Vec<ContentItem>, auth: StaticAuth) -> Harness {
    let backend = FakeBackend::with_rows(rows);
    let storage = Arc::new(FakeStorage::default());
    let durable = DurableStore::new(Arc::new(MemoryBackend::new()), DurableConfig::default());
    let content = Arc::new(ContentService::new(
        backend.clone(),
        backend.clone(),
        storage.clone(),
        Arc::new(auth),
        durable.clone(),
        OrchestratorConfig::default(),
    ));
    Harness {
        backend,
        storage,
        durable,
        content,
    }
}
