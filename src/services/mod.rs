pub mod condition_extractor;
pub mod execution; // Shard executors and the concurrent dispatcher
pub mod federation; // DataFusion fallback for cross-shard queries
pub mod merge;
pub mod query_service;
pub mod rewrite;
pub mod router;
pub mod rule_registry;
pub mod sharding;

pub use condition_extractor::*;
pub use query_service::*;
pub use router::ShardingRouter;
pub use rule_registry::*;
