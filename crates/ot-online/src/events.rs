//! Lifecycle events emitted by the trial runner.

use chrono::{DateTime, Utc};
use ot_types::Signature;
use serde::{Deserialize, Serialize};

/// What happened to a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunnerEventKind {
    /// A new trial joined the trial set as `Pending`.
    TrialAdded,
    TrialStarted,
    TrialPaused,
    /// Stopped by the scheduler or by the worse-than-champion test.
    TrialTerminated,
    /// Model construction failed at the first sample.
    TrialFailed { message: String },
    /// The trial became champion. `previous` is `None` for the initial champion.
    ChampionChanged { previous: Option<Signature> },
}

/// A single event, stamped with the runner step it occurred in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerEvent {
    pub step: u64,
    pub trial: Signature,
    pub kind: RunnerEventKind,
    pub timestamp: DateTime<Utc>,
}

impl RunnerEvent {
    pub fn new(step: u64, trial: impl Into<Signature>, kind: RunnerEventKind) -> Self {
        Self {
            step,
            trial: trial.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}
