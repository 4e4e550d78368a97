use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Ambiguous route: {0}")]
    AmbiguousRoute(String),

    #[error("Empty route: {0}")]
    EmptyRoute(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Unsupported statement: {0}")]
    Unsupported(String),

    #[error("Rewrite invariant violated: {0}")]
    RewriteInvariant(String),

    #[error("Execution failed on data source '{data_source}': {message}")]
    ShardExecution {
        data_source: String,
        sql: String,
        message: String,
    },

    #[error("Merge invariant violated: {0}")]
    MergeInvariant(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query timed out after {0} seconds")]
    Timeout(u64),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wrap an error raised by one shard with the identity needed to reproduce it
    pub fn shard(data_source: impl Into<String>, sql: impl Into<String>, err: AppError) -> Self {
        match err {
            // Already attributed, or not a shard failure at all
            AppError::ShardExecution { .. } | AppError::Cancelled | AppError::Timeout(_) => err,
            other => AppError::ShardExecution {
                data_source: data_source.into(),
                sql: sql.into(),
                message: other.to_string(),
            },
        }
    }

    /// Stable machine-readable code used in responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::AmbiguousRoute(_) => "AMBIGUOUS_ROUTE",
            AppError::EmptyRoute(_) => "EMPTY_ROUTE",
            AppError::InvalidSql(_) => "INVALID_SQL",
            AppError::Unsupported(_) => "UNSUPPORTED_STATEMENT",
            AppError::RewriteInvariant(_) => "REWRITE_INVARIANT",
            AppError::ShardExecution { .. } => "SHARD_EXECUTION_ERROR",
            AppError::MergeInvariant(_) => "MERGE_INVARIANT",
            AppError::Cancelled => "QUERY_CANCELLED",
            AppError::Timeout(_) => "QUERY_TIMEOUT",
            AppError::Connection(_) => "CONNECTION_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, error_detail) = match self {
            AppError::Configuration(msg) | AppError::AmbiguousRoute(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new(code, msg),
            ),
            AppError::EmptyRoute(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorDetail::new(code, msg),
            ),
            AppError::InvalidSql(msg) | AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new(code, msg),
            ),
            AppError::Unsupported(msg) => (
                StatusCode::NOT_IMPLEMENTED,
                ErrorDetail::new(code, msg),
            ),
            AppError::RewriteInvariant(msg) | AppError::MergeInvariant(msg) => {
                // Generator or merger bug: keep internals out of the response
                tracing::error!("Internal invariant violated: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetail::new(code, "Internal engine error, see server logs"),
                )
            }
            AppError::ShardExecution {
                data_source,
                sql,
                message,
            } => (
                StatusCode::BAD_GATEWAY,
                ErrorDetail::new(code, format!("Data source '{}': {}", data_source, message))
                    .with_details(sql),
            ),
            AppError::Cancelled => (
                StatusCode::CONFLICT,
                ErrorDetail::new(code, "Query cancelled"),
            ),
            AppError::Timeout(secs) => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorDetail::new(code, format!("Query timed out after {} seconds", secs)),
            ),
            AppError::Connection(msg) => (
                StatusCode::BAD_GATEWAY,
                ErrorDetail::new(code, msg),
            ),
            AppError::Database(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new(code, msg),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorDetail::new(code, msg),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new(code, msg),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(err: tokio_postgres::Error) -> Self {
        let message = match err.as_db_error() {
            Some(db_error) => format!(
                "Code: {}, Message: {}",
                db_error.code().code(),
                db_error.message()
            ),
            None => err.to_string(),
        };
        AppError::Database(message)
    }
}

impl From<datafusion::error::DataFusionError> for AppError {
    fn from(err: datafusion::error::DataFusionError) -> Self {
        AppError::Database(format!("Federation engine: {}", err))
    }
}

impl From<datafusion::arrow::error::ArrowError> for AppError {
    fn from(err: datafusion::arrow::error::ArrowError) -> Self {
        AppError::Internal(format!("Arrow conversion: {}", err))
    }
}
