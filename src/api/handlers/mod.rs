pub mod query;
pub mod rules;

use std::sync::Arc;

use crate::services::execution::ConnectionPoolManager;
use crate::services::QueryService;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
    pub pools: Arc<ConnectionPoolManager>,
}
