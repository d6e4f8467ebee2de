//! Applies change-feed events to the query cache.
//!
//! Policy for `posts` rows:
//!
//! - **insert** of a visible row: the aggregate and search lists are
//!   invalidated (and the featured list when the row is trending); the row is
//!   prepended to its category list in place.
//! - **update**: the detail record is replaced with the new row, or dropped
//!   when the row is no longer visible. A publication flip invalidates every
//!   list. A category move invalidates the old and new category lists. A
//!   trending flip invalidates the featured list. Anything else patches the
//!   row in place in every list that holds it.
//! - **delete**: the detail record is dropped and every list is invalidated.
//!
//! `categories` rows invalidate the category keys. Events are applied in
//! arrival order per table; applying the same event twice leaves the cache as
//! applying it once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ResourcePrefix;
use crate::cache::lock::mutex_lock;
use crate::domain::entities::ContentItem;
use crate::query::{Namespace, QueryClient, QueryData, QueryKey, QueryPrefix, QueryResource};

use super::events::{ChangeEvent, Operation};
use super::feed::{ChangeFeedTransport, ChannelStatus, FeedError, Subscription};

const SOURCE: &str = "realtime::listener";
const METRIC_EVENTS: &str = "paddock_change_events_total";

pub const POSTS_TABLE: &str = "posts";
pub const CATEGORIES_TABLE: &str = "categories";

/// Lower cache tiers that must forget superseded rows so refetches triggered
/// by an event do not reread them.
#[async_trait]
pub trait UpstreamInvalidator: Send + Sync {
    async fn invalidate_upstream(&self, prefixes: &[ResourcePrefix]);

    /// Post-process a row before it is patched into the query cache.
    fn present(&self, item: ContentItem) -> ContentItem {
        item
    }
}

/// Aggregate connection state across all subscribed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Subscribed,
    Lost,
}

impl Connectivity {
    fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a ChannelStatus>) -> Self {
        let mut any = false;
        let mut all_subscribed = true;
        for status in statuses {
            any = true;
            match status {
                ChannelStatus::Lost | ChannelStatus::Unsubscribed => return Connectivity::Lost,
                ChannelStatus::Connecting => all_subscribed = false,
                ChannelStatus::Subscribed => {}
            }
        }
        if any && all_subscribed {
            Connectivity::Subscribed
        } else {
            Connectivity::Connecting
        }
    }
}

#[derive(Clone)]
struct ChangeApplier {
    client: QueryClient,
    upstream: Option<Arc<dyn UpstreamInvalidator>>,
}

/// Where a row stood before an update, as far as the cache can tell.
struct PriorRow {
    published: bool,
    trending: bool,
    category: String,
}

impl ChangeApplier {
    async fn apply(&self, event: &ChangeEvent) {
        let operation = match event.operation {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        counter!(METRIC_EVENTS, "table" => event.table.clone(), "operation" => operation)
            .increment(1);

        match event.table.as_str() {
            POSTS_TABLE => {
                // Editor views include drafts and are simply refetched.
                self.client
                    .invalidate(&QueryPrefix::posts(Namespace::Admin));
                match event.operation {
                    Operation::Insert => self.apply_insert(event).await,
                    Operation::Update => self.apply_update(event).await,
                    Operation::Delete => self.apply_delete(event).await,
                }
            }
            CATEGORIES_TABLE => {
                self.client.invalidate(&QueryPrefix::categories(Namespace::Public));
                self.client.invalidate(&QueryPrefix::categories(Namespace::Admin));
                self.upstream(&[ResourcePrefix::Categories]).await;
                debug!(
                    category = ?event.new_category().map(|category| category.id),
                    "Category change applied"
                );
            }
            other => debug!(table = other, "Ignoring change for unwatched table"),
        }
    }

    async fn apply_insert(&self, event: &ChangeEvent) {
        let Some(item) = event.new_item() else {
            warn!("Insert event without a decodable row");
            return;
        };
        if !item.is_public() {
            debug!(item_id = item.id, "Ignoring insert of unpublished item");
            return;
        }

        let mut prefixes = vec![
            ResourcePrefix::Items,
            ResourcePrefix::Search,
            ResourcePrefix::Category(item.category.clone()),
        ];
        self.client.invalidate_where(|key| {
            key.namespace == Namespace::Public
                && matches!(key.resource, QueryResource::Items | QueryResource::Search(_))
        });
        if item.trending {
            self.client.invalidate(&QueryPrefix::from(&QueryKey::featured()));
            prefixes.push(ResourcePrefix::Featured);
        }

        self.upstream(&prefixes).await;
        let row = self.present(item);
        let patched = self
            .client
            .update_data(&QueryKey::category(row.category.clone()), |data| {
                let items = data.items()?;
                let mut next = Vec::with_capacity(items.len() + 1);
                next.push(row.clone());
                next.extend(items.iter().filter(|existing| existing.id != row.id).cloned());
                Some(QueryData::Items(Arc::new(next)))
            });
        debug!(item_id = row.id, patched, "Insert applied");
    }

    async fn apply_update(&self, event: &ChangeEvent) {
        let Some(item) = event.new_item() else {
            warn!("Update event without a decodable row");
            return;
        };
        let id = item.id;
        let prior = self.prior_row(event, id);
        let detail = QueryKey::item(id);
        let row = self.present(item);

        if row.is_public() {
            self.client.set_data(detail, QueryData::Item(Arc::new(row.clone())));
        } else {
            self.client.remove(&detail);
        }

        let mut prefixes = vec![ResourcePrefix::Item(id)];
        let flipped = match &prior {
            Some(prior) => prior.published != row.published,
            // Unknown history: a visible row may have just been published.
            None => row.is_public(),
        };

        if flipped {
            self.invalidate_lists();
            prefixes.push(ResourcePrefix::Lists);
            info!(item_id = id, published = row.published, "Publication change invalidated all lists");
        } else if !row.is_public() {
            debug!(item_id = id, "Update of hidden item leaves lists alone");
        } else {
            let prior = prior.as_ref();
            if let Some(prior) = prior.filter(|prior| prior.category != row.category) {
                for category in [&prior.category, &row.category] {
                    self.client.invalidate(&QueryPrefix::from(&QueryKey::category(category.clone())));
                    prefixes.push(ResourcePrefix::Category(category.clone()));
                }
            }
            if prior.is_some_and(|prior| prior.trending != row.trending) {
                self.client.invalidate(&QueryPrefix::from(&QueryKey::featured()));
            }
            let patched = self.patch_lists(&row);
            prefixes.extend([
                ResourcePrefix::Items,
                ResourcePrefix::Featured,
                ResourcePrefix::Search,
                ResourcePrefix::Category(row.category.clone()),
            ]);
            debug!(item_id = id, patched, "Update patched in place");
        }

        self.upstream(&prefixes).await;
    }

    async fn apply_delete(&self, event: &ChangeEvent) {
        let Some(id) = event.item_id() else {
            warn!("Delete event without a primary key");
            return;
        };
        let category = event
            .old_item()
            .map(|item| item.category)
            .filter(|category| !category.is_empty())
            .or_else(|| self.prior_row(event, id).map(|prior| prior.category));

        self.client.remove(&QueryKey::item(id));
        self.invalidate_lists();
        if let Some(category) = &category {
            self.client
                .invalidate(&QueryPrefix::from(&QueryKey::category(category.clone())));
        }

        let mut prefixes = vec![ResourcePrefix::Item(id), ResourcePrefix::Lists];
        if let Some(category) = category {
            prefixes.push(ResourcePrefix::Category(category));
        }
        self.upstream(&prefixes).await;
        info!(item_id = id, "Delete applied");
    }

    /// Previous state of a row: the event's old image when the table ships
    /// full rows, else whatever the cache still holds.
    fn prior_row(&self, event: &ChangeEvent, id: i64) -> Option<PriorRow> {
        let full_old_image = event
            .old_row
            .as_ref()
            .is_some_and(|row| row.get("published").is_some() && row.get("category").is_some());
        if full_old_image && let Some(old) = event.old_item() {
            return Some(PriorRow::from(&old));
        }

        if let Some(cached) = self
            .client
            .get_data(&QueryKey::item(id))
            .and_then(|data| data.item().cloned())
        {
            return Some(PriorRow::from(cached.as_ref()));
        }

        self.client
            .keys_matching(&QueryPrefix::posts(Namespace::Public))
            .into_iter()
            .filter(|key| key.resource.is_list())
            .filter_map(|key| self.client.get_data(&key))
            .find_map(|data| {
                data.items()
                    .and_then(|items| items.iter().find(|item| item.id == id))
                    .map(PriorRow::from)
            })
    }

    fn invalidate_lists(&self) -> usize {
        self.client
            .invalidate_where(|key| key.namespace == Namespace::Public && key.resource.is_list())
    }

    /// Replace the row in every public list that holds it.
    fn patch_lists(&self, row: &ContentItem) -> usize {
        self.client
            .keys_matching(&QueryPrefix::posts(Namespace::Public))
            .into_iter()
            .filter(|key| key.resource.is_list())
            .filter(|key| {
                self.client.update_data(key, |data| {
                    let items = data.items()?;
                    if !items.iter().any(|existing| existing.id == row.id) {
                        return None;
                    }
                    let next = items
                        .iter()
                        .map(|existing| {
                            if existing.id == row.id {
                                row.clone()
                            } else {
                                existing.clone()
                            }
                        })
                        .collect();
                    Some(QueryData::Items(Arc::new(next)))
                })
            })
            .count()
    }

    fn present(&self, item: ContentItem) -> ContentItem {
        match &self.upstream {
            Some(upstream) => upstream.present(item),
            None => item,
        }
    }

    async fn upstream(&self, prefixes: &[ResourcePrefix]) {
        if let Some(upstream) = &self.upstream {
            upstream.invalidate_upstream(prefixes).await;
        }
    }
}

impl From<&ContentItem> for PriorRow {
    fn from(item: &ContentItem) -> Self {
        Self {
            published: item.published,
            trending: item.trending,
            category: item.category.clone(),
        }
    }
}

/// Subscribes to the change feed and keeps the query cache in step with it.
pub struct ChangeFeedListener {
    applier: ChangeApplier,
    transport: Arc<dyn ChangeFeedTransport>,
    statuses: Arc<Mutex<HashMap<String, ChannelStatus>>>,
    connectivity: Arc<watch::Sender<Connectivity>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChangeFeedListener {
    pub fn new(client: QueryClient, transport: Arc<dyn ChangeFeedTransport>) -> Self {
        let (connectivity, _) = watch::channel(Connectivity::Connecting);
        Self {
            applier: ChangeApplier {
                client,
                upstream: None,
            },
            transport,
            statuses: Arc::new(Mutex::new(HashMap::new())),
            connectivity: Arc::new(connectivity),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamInvalidator>) -> Self {
        self.applier.upstream = Some(upstream);
        self
    }

    /// Subscribe to each table and start one ordered consumer per table.
    pub async fn start(&self, tables: &[&str]) -> Result<(), FeedError> {
        for table in tables {
            let subscription = self.transport.subscribe(table).await?;
            info!(table, "Change feed subscription opened");
            let task = tokio::spawn(consume(
                subscription,
                self.applier.clone(),
                Arc::clone(&self.statuses),
                Arc::clone(&self.connectivity),
            ));
            mutex_lock(&self.tasks, SOURCE, "start").push(task);
        }
        Ok(())
    }

    /// Apply one event directly, bypassing the transport.
    pub async fn apply(&self, event: &ChangeEvent) {
        self.applier.apply(event).await;
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    /// Unsubscribe from every table.
    pub fn stop(&self) {
        for task in mutex_lock(&self.tasks, SOURCE, "stop").drain(..) {
            task.abort();
        }
        let mut statuses = mutex_lock(&self.statuses, SOURCE, "stop");
        for status in statuses.values_mut() {
            *status = ChannelStatus::Unsubscribed;
        }
        self.connectivity
            .send_replace(Connectivity::aggregate(statuses.values()));
        info!("Change feed listener stopped");
    }
}

impl Drop for ChangeFeedListener {
    fn drop(&mut self) {
        for task in mutex_lock(&self.tasks, SOURCE, "drop").drain(..) {
            task.abort();
        }
    }
}

fn record_status(
    statuses: &Mutex<HashMap<String, ChannelStatus>>,
    connectivity: &watch::Sender<Connectivity>,
    table: &str,
    status: ChannelStatus,
) {
    let mut statuses = mutex_lock(statuses, SOURCE, "record_status");
    statuses.insert(table.to_string(), status);
    let aggregate = Connectivity::aggregate(statuses.values());
    connectivity.send_if_modified(|current| {
        let changed = *current != aggregate;
        *current = aggregate;
        changed
    });
}

async fn consume(
    subscription: Subscription,
    applier: ChangeApplier,
    statuses: Arc<Mutex<HashMap<String, ChannelStatus>>>,
    connectivity: Arc<watch::Sender<Connectivity>>,
) {
    let Subscription {
        table,
        mut events,
        mut status,
        mut handle,
    } = subscription;

    let initial = *status.borrow_and_update();
    record_status(&statuses, &connectivity, &table, initial);
    let mut status_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => applier.apply(&event).await,
                None => break,
            },
            changed = status.changed(), if status_open => match changed {
                Ok(()) => {
                    let current = *status.borrow_and_update();
                    debug!(table = %table, status = ?current, "Channel status changed");
                    record_status(&statuses, &connectivity, &table, current);
                }
                Err(_) => status_open = false,
            },
        }
    }

    handle.unsubscribe();
    record_status(&statuses, &connectivity, &table, ChannelStatus::Unsubscribed);
    info!(table = %table, "Change feed subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_aggregation() {
        use ChannelStatus::*;
        assert_eq!(Connectivity::aggregate(&[]), Connectivity::Connecting);
        assert_eq!(
            Connectivity::aggregate(&[Subscribed, Connecting]),
            Connectivity::Connecting
        );
        assert_eq!(
            Connectivity::aggregate(&[Subscribed, Subscribed]),
            Connectivity::Subscribed
        );
        assert_eq!(
            Connectivity::aggregate(&[Subscribed, Lost]),
            Connectivity::Lost
        );
    }
}
