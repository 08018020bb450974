// ABOUTME: Cache layer for quill, holding typed records in memory between the caller and a backend.
// ABOUTME: Tracks dirty and pinned entries, evicts clean ones by recency, and fronts an optional remote tier.

pub mod cache;
pub mod entry;
pub mod remote;

pub use cache::{CacheStats, FlushRetry, FlushTicket, RecordCache};
pub use entry::CacheEntry;
pub use remote::{MemoryRemote, RemoteCache, RemoteError, remote_key};

#[cfg(feature = "redis")]
pub use remote::RedisRemote;
