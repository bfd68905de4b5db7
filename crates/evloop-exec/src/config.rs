use std::{num::NonZeroUsize, thread};

use evloop_core::LoopError;
use serde::Deserialize;

/// Shape of a [`MultiThreadedEventLoopGroup`](crate::MultiThreadedEventLoopGroup).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoopGroupConfig {
    /// Number of loops, one OS thread each.
    pub threads: usize,
    /// Loop threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for LoopGroupConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            thread_name_prefix: "evloop".to_string(),
        }
    }
}

impl LoopGroupConfig {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), LoopError> {
        if self.threads == 0 {
            return Err(LoopError::Config("threads must be at least 1".into()));
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err(LoopError::Config("thread_name_prefix must not be empty".into()));
        }
        Ok(())
    }

    pub(crate) fn thread_name(&self, index: usize) -> String {
        format!("{}-{}", self.thread_name_prefix, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: LoopGroupConfig = serde_json::from_str(r#"{ "threads": 3 }"#).unwrap();
        assert_eq!(cfg.threads, 3);
        assert_eq!(cfg.thread_name_prefix, "evloop");
        assert!(cfg.validate().is_ok());

        let cfg: LoopGroupConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.threads >= 1);
        assert_eq!(cfg.thread_name(2), "evloop-2");
    }

    #[test]
    fn rejects_zero_threads() {
        let err = LoopGroupConfig::with_threads(0).validate().unwrap_err();
        assert!(matches!(err, LoopError::Config(msg) if msg.contains("threads")));
    }

    #[test]
    fn rejects_blank_prefix() {
        let cfg: LoopGroupConfig =
            serde_json::from_str(r#"{ "threads": 1, "thread_name_prefix": "  " }"#).unwrap();
        assert!(matches!(cfg.validate(), Err(LoopError::Config(_))));
    }
}
