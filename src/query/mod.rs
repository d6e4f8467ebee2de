//! Application-wide query cache with stale-while-revalidate reads, retry,
//! garbage collection and snapshot persistence.

pub mod client;
pub mod hooks;
pub mod key;
pub mod persist;
pub mod record;

pub use client::{QueryClient, QueryConfig, QueryObserver, RetryPolicy};
pub use hooks::ContentQueries;
pub use key::{InvalidQueryKey, Namespace, QueryKey, QueryPrefix, QueryResource};
pub use persist::{
    DehydrateFilter, DurablePersister, PersistError, PersistedRecord, PersistedSnapshot,
    Persister, SNAPSHOT_KEY, SNAPSHOT_VERSION,
};
pub use record::{QueryData, QueryError, QueryState, QueryStatus};
