// Federation: decide when per-unit execution cannot answer a query, and answer
// it with DataFusion instead

pub mod convert;
pub mod decider;
pub mod engine;
pub mod session;

pub use decider::{FederationDecider, FederationDecision};
pub use engine::{federation_sql, DataFusionFederationEngine, FederationEngine};
pub use session::{FederationSessionFactory, SessionSettings};
