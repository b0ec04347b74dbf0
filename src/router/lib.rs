//! Stateless request router: space cache, partition routing hash, and
//! scatter-gather merge. Holds no persistent state of its own — every
//! fact it acts on (space layout, partition leadership) is read through
//! `MetaReader` and cached locally with explicit invalidation.

pub mod cache;
pub mod dispatch;
pub mod partition;
pub mod request;
pub mod search;
pub mod server;

pub use cache::SpaceCache;
pub use dispatch::{dispatch_write, search_partitions};
pub use partition::{group_by_partition, partition_for_key};
pub use request::{RequestHead, RouterRequest, DEFAULT_TIMEOUT_MS};
pub use search::{merge_hits, merge_msearch, pick_replica, Hit, LoadBalance, PartitionHits};
pub use server::RouterServer;
