// Key generators
//
// Fill generated key columns of INSERT statements that do not provide them.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::api::middleware::AppError;
use crate::models::Value;

/// 2016-11-01T00:00:00Z in milliseconds
const SNOWFLAKE_EPOCH_MS: i64 = 1_477_958_400_000;
const WORKER_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER_ID: u64 = (1 << WORKER_ID_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyGeneratorConfig {
    Snowflake {
        #[serde(default)]
        worker_id: u64,
    },
    Uuid,
}

#[derive(Debug, Default)]
struct SnowflakeState {
    last_ms: i64,
    sequence: u64,
}

#[derive(Debug)]
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<SnowflakeState>,
}

impl SnowflakeGenerator {
    pub fn new(worker_id: u64) -> Result<Self, AppError> {
        if worker_id > MAX_WORKER_ID {
            return Err(AppError::Configuration(format!(
                "Snowflake worker_id {} exceeds {}",
                worker_id, MAX_WORKER_ID
            )));
        }
        Ok(Self {
            worker_id,
            state: Mutex::new(SnowflakeState::default()),
        })
    }

    /// 41 bits of milliseconds, 10 bits of worker id, 12 bits of sequence
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Never step backwards, even if the wall clock does
        let mut now = chrono::Utc::now().timestamp_millis().max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = chrono::Utc::now().timestamp_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        let elapsed = (now - SNOWFLAKE_EPOCH_MS).max(0) as u64;
        ((elapsed << (WORKER_ID_BITS + SEQUENCE_BITS)) | (self.worker_id << SEQUENCE_BITS) | state.sequence) as i64
    }
}

/// Configured key generator instance
#[derive(Debug)]
pub enum KeyGenerator {
    Snowflake(SnowflakeGenerator),
    Uuid,
}

impl KeyGenerator {
    pub fn from_config(config: &KeyGeneratorConfig) -> Result<Self, AppError> {
        Ok(match config {
            KeyGeneratorConfig::Snowflake { worker_id } => KeyGenerator::Snowflake(SnowflakeGenerator::new(*worker_id)?),
            KeyGeneratorConfig::Uuid => KeyGenerator::Uuid,
        })
    }

    pub fn next_key(&self) -> Value {
        match self {
            KeyGenerator::Snowflake(generator) => Value::Int(generator.next_id()),
            KeyGenerator::Uuid => Value::Text(uuid::Uuid::new_v4().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_is_strictly_increasing() {
        let generator = SnowflakeGenerator::new(3).unwrap();
        let mut previous = generator.next_id();
        for _ in 0..10_000 {
            let next = generator.next_id();
            assert!(next > previous);
            previous = next;
        }
        assert_eq!((previous >> SEQUENCE_BITS) & MAX_WORKER_ID as i64, 3);
    }

    #[test]
    fn test_worker_id_bounds() {
        assert!(SnowflakeGenerator::new(1024).is_err());
    }

    #[test]
    fn test_uuid_generator() {
        let generator = KeyGenerator::from_config(&KeyGeneratorConfig::Uuid).unwrap();
        match (generator.next_key(), generator.next_key()) {
            (Value::Text(a), Value::Text(b)) => {
                assert_eq!(a.len(), 36);
                assert_ne!(a, b);
            }
            other => panic!("unexpected keys {:?}", other),
        }
    }
}
