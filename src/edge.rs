use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, AppError> {
        match value {
            0 => Ok(Level::Low),
            1 => Ok(Level::High),
            _ => Err(AppError::InvalidValue("Value must be 0 or 1".into())),
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// Level the line settles at after this edge.
    pub fn level(self) -> Level {
        match self {
            Edge::Rising => Level::High,
            Edge::Falling => Level::Low,
        }
    }

    pub fn between(from: Level, to: Level) -> Option<Self> {
        match (from, to) {
            (Level::Low, Level::High) => Some(Edge::Rising),
            (Level::High, Level::Low) => Some(Edge::Falling),
            _ => None,
        }
    }
}

/// One raw transition as reported by the line handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEdgeEvent {
    pub edge: Edge,
    /// Time on the source's monotonic clock, see [`EdgeEventSource::now`].
    pub timestamp: Duration,
}

/// One claimed digital line that can be watched for edges.
///
/// Lifecycle: claimed on construction, armed by [`arm`](Self::arm), released by
/// [`release`](Self::release). After arming, only the owning monitor touches it.
pub trait EdgeEventSource: Send + 'static {
    fn arm(&mut self) -> Result<(), AppError>;

    /// Block for at most `timeout`. `Ok(None)` means no edge arrived in time.
    fn wait_for_edge(&mut self, timeout: Duration) -> Result<Option<RawEdgeEvent>, AppError>;

    fn read_level(&self) -> Result<Level, AppError>;

    /// Idempotent.
    fn release(&mut self) -> Result<(), AppError>;

    /// Current time on the clock that stamps this source's events.
    fn now(&self) -> Duration;
}
