// Sharding algorithms
//
// Each algorithm maps the values a sharding column is constrained to onto a subset
// of candidate targets (data source names or physical table names).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::inline;
use crate::api::middleware::AppError;
use crate::models::{ConditionValues, Value, ValueRange};

/// Closed set of configured sharding algorithms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardingAlgorithm {
    /// `value mod sharding_count`, matched against the target's numeric suffix
    Mod { sharding_count: u32 },
    /// Stable hash of the value's text, modulo `sharding_count`
    HashMod { sharding_count: u32 },
    /// Inline expression producing the target name, e.g. `orders_${user_id % 4}`
    Inline { algorithm_expression: String },
    /// Partition i covers `[ranges[i-1], ranges[i])`, open at both ends
    BoundaryRange { sharding_ranges: Vec<i64> },
    /// Partitions of width `sharding_volume` between `range_lower` and `range_upper`
    VolumeRange {
        range_lower: i64,
        range_upper: i64,
        sharding_volume: i64,
    },
}

/// Numeric suffix of a target name: `orders_13` → 13
pub fn target_suffix(target: &str) -> Option<i64> {
    let digits = target.len() - target.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    target[target.len() - digits..].parse().ok()
}

/// 64-bit FNV-1a
fn fnv1a(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl ShardingAlgorithm {
    pub fn type_name(&self) -> &'static str {
        match self {
            ShardingAlgorithm::Mod { .. } => "MOD",
            ShardingAlgorithm::HashMod { .. } => "HASH_MOD",
            ShardingAlgorithm::Inline { .. } => "INLINE",
            ShardingAlgorithm::BoundaryRange { .. } => "BOUNDARY_RANGE",
            ShardingAlgorithm::VolumeRange { .. } => "VOLUME_RANGE",
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        match self {
            ShardingAlgorithm::Mod { sharding_count } | ShardingAlgorithm::HashMod { sharding_count } => {
                if *sharding_count == 0 {
                    return Err(AppError::Configuration(format!(
                        "{} algorithm requires sharding_count > 0",
                        self.type_name()
                    )));
                }
            }
            ShardingAlgorithm::Inline { algorithm_expression } => {
                if !algorithm_expression.contains('{') {
                    return Err(AppError::Configuration(format!(
                        "INLINE expression '{}' contains no placeholder",
                        algorithm_expression
                    )));
                }
            }
            ShardingAlgorithm::BoundaryRange { sharding_ranges } => {
                if sharding_ranges.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(AppError::Configuration(
                        "BOUNDARY_RANGE sharding_ranges must be strictly ascending".to_string(),
                    ));
                }
            }
            ShardingAlgorithm::VolumeRange {
                range_lower,
                range_upper,
                sharding_volume,
            } => {
                if *sharding_volume <= 0 || range_upper <= range_lower {
                    return Err(AppError::Configuration(
                        "VOLUME_RANGE requires range_lower < range_upper and sharding_volume > 0".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Select the targets satisfying `values`
    ///
    /// # Arguments
    /// * `column` - sharding column the values belong to
    /// * `targets` - candidate names, in rule declaration order
    /// * `values` - precise values or a range
    ///
    /// # Returns
    /// Matching targets in the order of `targets`
    pub fn do_sharding(&self, column: &str, targets: &[String], values: &ConditionValues) -> Result<Vec<String>, AppError> {
        let selected: BTreeSet<usize> = match values {
            ConditionValues::Precise(list) => {
                let mut selected = BTreeSet::new();
                for value in list {
                    if value.is_null() {
                        continue;
                    }
                    selected.extend(self.precise(column, targets, value)?);
                }
                selected
            }
            ConditionValues::Range(range) => self.range(targets, range),
        };
        Ok(selected.into_iter().map(|i| targets[i].clone()).collect())
    }

    fn integer(column: &str, value: &Value) -> Result<i64, AppError> {
        value.as_i64().ok_or_else(|| {
            AppError::Validation(format!(
                "Sharding value '{}' for column '{}' is not an integer",
                value, column
            ))
        })
    }

    fn by_suffix(targets: &[String], shard: i64) -> impl Iterator<Item = usize> + '_ {
        targets
            .iter()
            .enumerate()
            .filter(move |(_, t)| target_suffix(t) == Some(shard))
            .map(|(i, _)| i)
    }

    fn precise(&self, column: &str, targets: &[String], value: &Value) -> Result<Vec<usize>, AppError> {
        let shard = match self {
            ShardingAlgorithm::Mod { sharding_count } => Self::integer(column, value)?.rem_euclid(i64::from(*sharding_count)),
            ShardingAlgorithm::HashMod { sharding_count } => {
                (fnv1a(&value.to_string()) % u64::from(*sharding_count)) as i64
            }
            ShardingAlgorithm::Inline { algorithm_expression } => {
                let name = inline::evaluate(algorithm_expression, column, value)?;
                return Ok(targets
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.eq_ignore_ascii_case(&name))
                    .map(|(i, _)| i)
                    .collect());
            }
            ShardingAlgorithm::BoundaryRange { .. } | ShardingAlgorithm::VolumeRange { .. } => {
                let v = Self::integer(column, value)?;
                self.partition_of(v)
            }
        };
        Ok(Self::by_suffix(targets, shard).collect())
    }

    fn range(&self, targets: &[String], range: &ValueRange) -> BTreeSet<usize> {
        let all = || (0..targets.len()).collect::<BTreeSet<usize>>();
        if range.is_empty() {
            return BTreeSet::new();
        }
        match self {
            ShardingAlgorithm::Mod { sharding_count } => {
                let count = i64::from(*sharding_count);
                match range.integer_bounds() {
                    Some((low, high))
                        if high >= low && high.checked_sub(low).map(|span| span < count - 1).unwrap_or(false) =>
                    {
                        let mut selected = BTreeSet::new();
                        for v in low..=high {
                            selected.extend(Self::by_suffix(targets, v.rem_euclid(count)));
                        }
                        selected
                    }
                    Some((low, high)) if high < low => BTreeSet::new(),
                    _ => all(),
                }
            }
            ShardingAlgorithm::HashMod { .. } | ShardingAlgorithm::Inline { .. } => all(),
            ShardingAlgorithm::BoundaryRange { .. } | ShardingAlgorithm::VolumeRange { .. } => {
                let Some((low, high)) = range.clamped_integer_bounds() else {
                    return all();
                };
                if high < low {
                    return BTreeSet::new();
                }
                let (first, last) = (self.partition_of(low), self.partition_of(high));
                let mut selected = BTreeSet::new();
                for partition in first..=last {
                    selected.extend(Self::by_suffix(targets, partition));
                }
                selected
            }
        }
    }

    /// Partition index of an integer for the range algorithms
    fn partition_of(&self, value: i64) -> i64 {
        let boundaries: Vec<i64> = match self {
            ShardingAlgorithm::BoundaryRange { sharding_ranges } => sharding_ranges.clone(),
            ShardingAlgorithm::VolumeRange {
                range_lower,
                range_upper,
                sharding_volume,
            } => {
                let mut bounds = Vec::new();
                let mut b = *range_lower;
                while b < *range_upper {
                    bounds.push(b);
                    b = b.saturating_add(*sharding_volume);
                }
                bounds.push(*range_upper);
                bounds
            }
            _ => return 0,
        };
        boundaries.iter().take_while(|b| value >= **b).count() as i64
    }
}
