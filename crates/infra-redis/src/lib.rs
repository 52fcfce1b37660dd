// Conveyor Redis infrastructure - implements the queue store port on a
// Redis-compatible server with atomic Lua command scripts

pub mod connection;
pub mod keys;
pub mod scripts;
pub mod store;

pub use connection::{map_redis_error, StoreConnection};
pub use keys::KeyLayout;
pub use scripts::Scripts;
pub use store::RedisQueueStore;

use std::sync::Arc;

use conveyor_core::application::Queue;
use conveyor_core::domain::QueueOptions;
use conveyor_core::error::Result;
use conveyor_core::port::{SystemTimeProvider, TimeProvider};

/// Convenience constructor wiring a queue to a Redis store.
pub async fn open_queue(url: &str, name: &str, opts: QueueOptions) -> Result<Queue> {
    let conn = StoreConnection::connect(url).await?;
    open_queue_with(conn, name, opts, Arc::new(SystemTimeProvider))
}

/// Build a queue over an existing connection (shared across queues).
pub fn open_queue_with(
    conn: StoreConnection,
    name: &str,
    opts: QueueOptions,
    time_provider: Arc<dyn TimeProvider>,
) -> Result<Queue> {
    let store = Arc::new(RedisQueueStore::new(
        conn,
        opts.prefix.clone(),
        name,
        time_provider.clone(),
    ));
    Ok(Queue::new(name, store, time_provider, opts, None))
}
