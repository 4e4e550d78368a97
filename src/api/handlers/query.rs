use axum::{extract::State, Json};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::AppState;
use crate::api::middleware::AppError;
use crate::models::{PreviewResponse, PreviewUnit, QueryRequest, QueryResponse};
use crate::services::execution::{CancellationToken, PoolStatus};
use crate::services::{ExecutionOutcome, QueryService, RouteStatisticsSnapshot};

fn validate(payload: &QueryRequest) -> Result<&str, AppError> {
    let sql = payload.sql.trim();
    if sql.is_empty() {
        return Err(AppError::Validation("SQL query cannot be empty".to_string()));
    }
    Ok(sql)
}

/// Route and rewrite a statement without running it
pub async fn preview_query(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<PreviewResponse>, AppError> {
    let sql = validate(&payload)?;
    let prepared = state.service.prepare(sql, &payload.parameters)?;

    let units = QueryService::units_by_data_source(&prepared)
        .into_iter()
        .map(|(data_source, units)| {
            let units = units
                .into_iter()
                .map(|unit| PreviewUnit {
                    sql: unit.sql.clone(),
                    parameters: unit.parameters.clone(),
                    tables: unit
                        .unit
                        .table_mappers
                        .iter()
                        .map(|m| (m.logic_name.clone(), m.actual_name.clone()))
                        .collect(),
                })
                .collect();
            (data_source, units)
        })
        .collect();

    let context = &prepared.context;
    Ok(Json(PreviewResponse {
        statement_kind: format!("{:?}", context.statement.kind).to_uppercase(),
        rule_version: context.rules.version,
        full_scan: context.route.full_scan,
        federated: context.decision.use_federation,
        federation_reason: context.decision.reason.clone(),
        federation_nodes: context
            .decision
            .data_nodes
            .iter()
            .map(|(table, nodes)| (table.clone(), nodes.iter().map(|n| n.to_string()).collect()))
            .collect(),
        units,
    }))
}

/// Execute a statement across its shards
pub async fn execute_query(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let sql = validate(&payload)?;
    tracing::info!("Executing statement: {}", sql);

    let start = Instant::now();
    // Dropping the request future cancels in-flight units
    let cancel = CancellationToken::new();
    let _guard = cancel.drop_guard();
    let timeout = payload.timeout_secs.map(Duration::from_secs);
    let outcome = state
        .service
        .execute(sql, &payload.parameters, &cancel, timeout)
        .await?;

    let response = match outcome {
        ExecutionOutcome::Query(cursor) => {
            let columns = cursor.columns().to_vec();
            let rows = cursor.collect_rows()?;
            QueryResponse::rows(columns, rows, start.elapsed().as_millis() as u64)
        }
        ExecutionOutcome::Update { affected_rows } => {
            QueryResponse::update(affected_rows, start.elapsed().as_millis() as u64)
        }
    };
    tracing::info!(
        "Statement {} finished in {}ms",
        response.id,
        response.execution_time_ms
    );
    Ok(Json(response))
}

#[derive(Debug, serde::Serialize)]
pub struct StatsResponse {
    pub rule_version: u64,
    pub routing: RouteStatisticsSnapshot,
    pub data_sources: Vec<String>,
    /// PostgreSQL pool usage per data source
    pub pools: BTreeMap<String, PoolStatus>,
}

/// Routing counters and pool usage
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let data_sources: Vec<String> = state
        .service
        .data_sources()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut pools = BTreeMap::new();
    for name in &data_sources {
        if let Some(status) = state.pools.pool_status(name).await {
            pools.insert(name.clone(), status);
        }
    }
    Ok(Json(StatsResponse {
        rule_version: state.service.rules().snapshot().version,
        routing: state.service.statistics(),
        data_sources,
        pools,
    }))
}
