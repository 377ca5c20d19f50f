use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Buffering configuration for the stream flush loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Number of buffered rows that triggers a flush.
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
    /// Interval, in milliseconds, of the periodic flush.
    #[serde(default = "default_batch_max_fill_ms")]
    pub max_fill_ms: u64,
    /// Capacity of the channel between the binlog handler and the flush loop.
    ///
    /// A full channel blocks the binlog reader, which is how back-pressure reaches the source.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl BatchConfig {
    pub const DEFAULT_MAX_SIZE: usize = 100;

    pub const DEFAULT_MAX_FILL_MS: u64 = 200;

    pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.max_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.max_fill_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.max_fill_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.channel_capacity == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.channel_capacity".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            max_fill_ms: default_batch_max_fill_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_batch_max_size() -> usize {
    BatchConfig::DEFAULT_MAX_SIZE
}

fn default_batch_max_fill_ms() -> u64 {
    BatchConfig::DEFAULT_MAX_FILL_MS
}

fn default_channel_capacity() -> usize {
    BatchConfig::DEFAULT_CHANNEL_CAPACITY
}
