//! Partition configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options controlling how a partition checkpoints and supervises its lambda.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionOptions {
    /// Record each offset as checkpointable once its handler returns.
    ///
    /// When disabled, only offsets reported through the lambda's context are
    /// checkpointed.
    pub auto_checkpoint: bool,

    /// Flush the checkpoint on this interval, in addition to on drain.
    pub checkpoint_interval: Option<Duration>,

    /// Treat handler calls running longer than this as fatal.
    pub handler_timeout: Option<Duration>,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            auto_checkpoint: true,
            checkpoint_interval: None,
            handler_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_options_use_defaults() {
        let options: PartitionOptions =
            serde_json::from_str(r#"{ "handler_timeout": { "secs": 5, "nanos": 0 } }"#).unwrap();

        assert!(options.auto_checkpoint);
        assert_eq!(options.checkpoint_interval, None);
        assert_eq!(options.handler_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_empty_options_are_default() {
        let options: PartitionOptions = serde_json::from_str("{}").unwrap();

        assert_eq!(options, PartitionOptions::default());
    }
}
