//! Outcome of the rule-check phase.

use crate::error::{BlockError, BlockType, SentinelRule};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What the rule-check slots decided for an entry.
#[derive(Debug, Clone, Default)]
pub enum TokenResult {
    #[default]
    Pass,
    Blocked(BlockError),
    /// Asks the caller to hold off for the given duration. The pipeline does not sleep: it
    /// admits the entry as a pass and leaves the delay to the caller.
    Wait(Duration),
}

impl TokenResult {
    pub fn blocked(block_type: BlockType) -> Self {
        Self::Blocked(BlockError::new(block_type))
    }

    pub fn blocked_with_msg(block_type: BlockType, msg: impl Into<String>) -> Self {
        Self::Blocked(BlockError::with_message(block_type, msg))
    }

    pub fn blocked_with_cause(
        block_type: BlockType,
        msg: impl Into<String>,
        rule: Arc<dyn SentinelRule>,
        snapshot_value: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self::Blocked(BlockError::with_cause(block_type, msg, rule, snapshot_value))
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Self::Wait(_))
    }

    pub fn block_error(&self) -> Option<&BlockError> {
        match self {
            Self::Blocked(err) => Some(err),
            _ => None,
        }
    }

    pub fn wait_duration(&self) -> Option<Duration> {
        match self {
            Self::Wait(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for TokenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("TokenResult{status=Pass}"),
            Self::Blocked(err) => write!(f, "TokenResult{{status=Blocked, blockErr={}}}", err),
            Self::Wait(d) => write!(f, "TokenResult{{status=Wait, waitMs={}}}", d.as_millis()),
        }
    }
}
