// Rule registry
//
// Holds the active rule snapshot. Statements take an `Arc` once and keep it for
// their whole lifetime; a swap installs a new model without touching the old one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::api::middleware::AppError;
use crate::models::{RuleConfig, RuleModel};

/// A rule model together with the version it was installed as
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub version: u64,
    pub model: Arc<RuleModel>,
}

#[derive(Debug)]
pub struct RuleRegistry {
    current: RwLock<RuleSnapshot>,
    next_version: AtomicU64,
}

impl RuleRegistry {
    pub fn new(model: RuleModel) -> Self {
        Self {
            current: RwLock::new(RuleSnapshot {
                version: 1,
                model: Arc::new(model),
            }),
            next_version: AtomicU64::new(2),
        }
    }

    pub fn from_config(config: RuleConfig) -> Result<Self, AppError> {
        Ok(Self::new(RuleModel::try_from_config(config)?))
    }

    /// The snapshot in force right now
    pub fn snapshot(&self) -> RuleSnapshot {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate `config` and install it; in-flight statements keep their old snapshot
    ///
    /// # Returns
    /// The version of the installed model
    pub fn swap(&self, config: RuleConfig) -> Result<u64, AppError> {
        let model = Arc::new(RuleModel::try_from_config(config)?);
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = RuleSnapshot { version, model };
        info!("Installed sharding rules version {}", version);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(data_sources: &[&str]) -> RuleConfig {
        RuleConfig {
            data_sources: data_sources.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_swap_does_not_tear_held_snapshot() {
        let registry = RuleRegistry::from_config(config(&["ds_0"])).unwrap();
        let held = registry.snapshot();
        let version = registry.swap(config(&["ds_0", "ds_1"])).unwrap();
        assert_eq!(version, 2);
        assert_eq!(held.model.data_sources(), ["ds_0".to_string()]);
        assert_eq!(registry.snapshot().model.data_sources().len(), 2);
        assert_eq!(registry.snapshot().version, 2);
    }

    #[test]
    fn test_invalid_swap_keeps_current() {
        let registry = RuleRegistry::from_config(config(&["ds_0"])).unwrap();
        assert!(registry.swap(config(&[])).is_err());
        assert_eq!(registry.snapshot().version, 1);
    }
}
