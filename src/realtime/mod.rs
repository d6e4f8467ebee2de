//! Realtime change feed: wire events, transports, and the listener that
//! applies them to the query cache.

pub mod events;
pub mod feed;
pub mod listener;

pub use events::{ChangeEvent, Operation};
pub use feed::{
    ChangeFeedTransport, ChannelStatus, ChannelTransport, FeedError, Subscription,
    SubscriptionHandle,
};
pub use listener::{
    CATEGORIES_TABLE, ChangeFeedListener, Connectivity, POSTS_TABLE, UpstreamInvalidator,
};
