pub mod geo;
pub mod pool;
pub mod score;
pub mod sync;

pub use geo::{haversine_km, pickup_distance_km, Coordinate};
pub use pool::{JobPool, PoolDelta, PoolEntry};
pub use score::{rank, score_job, PriorityConfig, ScoredJob};
pub use sync::{PoolSynchronizer, Subscription, SyncHandle, SyncMessage};
