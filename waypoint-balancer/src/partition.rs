use crate::errors::{BalancerError, Result};
use crate::properties::{HashAlgorithm, PartitionProperties};
use crate::ring::hash_key;

/// How a call is routed to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// No key: only valid for single partition clusters, a random ring point is used
    Any,
    /// Routing key, mapped to a partition and then to a ring position
    Key(&'a str),
    /// Explicit partition id, a random ring point inside it is used
    Partition(u32),
}

/// Maps routing keys to partition ids of one cluster. Pure, cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAccessor {
    Single,
    Hash {
        partition_count: u32,
        algorithm: HashAlgorithm,
    },
    Range {
        key_range_start: i64,
        partition_size: i64,
        partition_count: u32,
    },
}

impl PartitionAccessor {
    pub fn from_properties(properties: &PartitionProperties) -> Result<Self> {
        properties.validate()?;
        Ok(match properties {
            PartitionProperties::None => PartitionAccessor::Single,
            PartitionProperties::Hash {
                partition_count,
                hash_algorithm,
            } => PartitionAccessor::Hash {
                partition_count: *partition_count,
                algorithm: *hash_algorithm,
            },
            PartitionProperties::Range {
                key_range_start,
                partition_size,
                partition_count,
            } => PartitionAccessor::Range {
                key_range_start: *key_range_start,
                partition_size: *partition_size,
                partition_count: *partition_count,
            },
        })
    }

    pub fn partition_count(&self) -> u32 {
        match self {
            PartitionAccessor::Single => 1,
            PartitionAccessor::Hash {
                partition_count, ..
            }
            | PartitionAccessor::Range {
                partition_count, ..
            } => *partition_count,
        }
    }

    /// Checks an explicit id against `[0, partition_count)`.
    pub fn validate_id(&self, partition_id: u32) -> Result<u32> {
        if partition_id >= self.partition_count() {
            return Err(BalancerError::PartitionRouting(format!(
                "partition {} is outside [0, {})",
                partition_id,
                self.partition_count()
            )));
        }
        Ok(partition_id)
    }

    pub fn partition_for_key(&self, key: &str) -> Result<u32> {
        match self {
            PartitionAccessor::Single => Ok(0),
            PartitionAccessor::Hash {
                partition_count,
                algorithm: HashAlgorithm::Sip,
            } => Ok(hash_key(key.as_bytes()) % partition_count),
            PartitionAccessor::Hash {
                partition_count,
                algorithm: HashAlgorithm::Modulo,
            } => {
                let value = parse_key(key)?;
                Ok(value.rem_euclid(*partition_count as i64) as u32)
            }
            PartitionAccessor::Range {
                key_range_start,
                partition_size,
                partition_count,
            } => {
                let value = parse_key(key)?;
                if value < *key_range_start {
                    return Err(BalancerError::PartitionRouting(format!(
                        "key {} is below the key range start {}",
                        value, key_range_start
                    )));
                }
                // exact for any pair of i64 values
                let offset = i128::from(value) - i128::from(*key_range_start);
                let id = offset
                    .checked_div(i128::from(*partition_size))
                    .filter(|id| *id >= 0)
                    .ok_or_else(|| {
                        BalancerError::PartitionRouting(format!(
                            "key {} cannot be placed in a range starting at {} with size {}",
                            value, key_range_start, partition_size
                        ))
                    })?;
                if id >= i128::from(*partition_count) {
                    return Err(BalancerError::PartitionRouting(format!(
                        "key {} maps to partition {} outside [0, {})",
                        value, id, partition_count
                    )));
                }
                Ok(id as u32)
            }
        }
    }

    /// Partition of a route.
    pub fn partition_for(&self, route: Route<'_>) -> Result<u32> {
        match route {
            Route::Any => match self {
                PartitionAccessor::Single => Ok(0),
                _ => Err(BalancerError::PartitionRouting(format!(
                    "a routing key is required, the cluster has {} partitions",
                    self.partition_count()
                ))),
            },
            Route::Key(key) => self.partition_for_key(key),
            Route::Partition(id) => self.validate_id(id),
        }
    }
}

fn parse_key(key: &str) -> Result<i64> {
    key.trim().parse::<i64>().map_err(|_| {
        BalancerError::PartitionRouting(format!("key '{}' is not an integer", key))
    })
}
