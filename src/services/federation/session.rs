// Federation session factory
//
// Builds configured DataFusion SessionContext instances. One session is created
// per federated statement and dropped with it.

use anyhow::{Context, Result};
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::execution::SessionStateBuilder;
use datafusion::prelude::{SessionConfig, SessionContext};

/// Settings applied to every federation session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Batch size for query execution
    pub batch_size: usize,
    /// Number of partitions for parallel execution
    pub target_partitions: usize,
    /// Upper bound on memory used by one session, in bytes
    pub memory_limit: Option<usize>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: num_cpus::get(),
            memory_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FederationSessionFactory {
    settings: SessionSettings,
}

impl FederationSessionFactory {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Create a session with the factory's settings
    ///
    /// # Returns
    /// A `SessionContext` with the default SQL functions registered
    pub fn create_session(&self) -> Result<SessionContext> {
        let config = SessionConfig::new()
            .with_batch_size(self.settings.batch_size)
            .with_target_partitions(self.settings.target_partitions);

        let Some(limit) = self.settings.memory_limit else {
            return Ok(SessionContext::new_with_config(config));
        };

        let runtime_env = RuntimeEnvBuilder::new()
            .with_memory_limit(limit, 1.0)
            .build_arc()
            .context("Failed to create federation runtime environment")?;
        let state = SessionStateBuilder::new()
            .with_config(config)
            .with_runtime_env(runtime_env)
            .with_default_features()
            .build();
        Ok(SessionContext::new_with_state(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.batch_size, 8192);
        assert!(settings.memory_limit.is_none());
    }

    #[tokio::test]
    async fn test_session_runs_sql() {
        let session = FederationSessionFactory::default().create_session().unwrap();
        let batches = session.sql("SELECT 1 + 1 AS two").await.unwrap().collect().await.unwrap();
        assert_eq!(batches[0].num_rows(), 1);
    }

    #[tokio::test]
    async fn test_session_with_memory_limit() {
        let factory = FederationSessionFactory::new(SessionSettings {
            memory_limit: Some(64 * 1024 * 1024),
            ..Default::default()
        });
        let session = factory.create_session().unwrap();
        let batches = session.sql("SELECT COUNT(*) FROM (VALUES (1), (2)) t(x)").await.unwrap().collect().await.unwrap();
        assert_eq!(batches[0].num_rows(), 1);
    }
}
