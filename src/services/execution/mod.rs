pub mod cancellation;
pub mod dispatcher;
pub mod executor;
pub mod pool;
pub mod postgres;
pub mod sqlite;

pub use cancellation::{CancellationToken, DropGuard};
pub use dispatcher::ExecutionDispatcher;
pub use executor::{ExecutorRegistry, ShardExecutor};
pub use pool::{ConnectionPoolManager, PoolStatus};
pub use postgres::PostgresShardExecutor;
pub use sqlite::SqliteShardExecutor;
