use axum::{extract::State, Json};

use super::AppState;
use crate::api::middleware::AppError;
use crate::models::{RuleConfig, RulesResponse};

/// Current rule set and its version
pub async fn get_rules(State(state): State<AppState>) -> Result<Json<RulesResponse>, AppError> {
    let snapshot = state.service.rules().snapshot();
    Ok(Json(RulesResponse {
        version: snapshot.version,
        rules: snapshot.model.config().clone(),
    }))
}

/// Replace the rule set
///
/// Statements already running keep the rules they started with.
pub async fn put_rules(
    State(state): State<AppState>,
    Json(payload): Json<RuleConfig>,
) -> Result<Json<RulesResponse>, AppError> {
    let version = state.service.rules().swap(payload)?;
    tracing::info!("Installed sharding rules version {}", version);

    let snapshot = state.service.rules().snapshot();
    Ok(Json(RulesResponse {
        version: snapshot.version,
        rules: snapshot.model.config().clone(),
    }))
}
