//! # ot-online
//!
//! Online hyperparameter tuning over a live sample stream.
//!
//! An [`OnlineTrialRunner`] keeps a bounded set of candidate configurations
//! (trials) learning side by side. Each labeled sample is one step: every
//! running trial trains on it, the best challenger is tested against the
//! champion with confidence bounds, confidently worse trials are evicted and
//! the [`ChampionFrontierSearcher`] proposes new challengers around the
//! champion. [`AutoTuner`] wraps the runner behind `predict`/`learn`, and
//! [`TunerService`] serves a tuner from a dedicated tokio task.

mod config;
mod events;
mod interactions;
mod oracle;
mod pool;
mod result;
mod runner;
mod scheduler;
mod service;
mod trial;
mod tuner;

pub use config::{
    ChaChaConfig, ChampionTest, KeepRatio, LossMetric, ModelSelectPolicy, OracleConfig,
    ResourceLease, RunnerConfig, ScorePolicy, SelectionMode, TrialArgs, TunerConfig,
};
pub use events::{RunnerEvent, RunnerEventKind};
pub use interactions::{generate_all_comb, strip_self_interactions};
pub use oracle::ChampionFrontierSearcher;
pub use pool::TrialPool;
pub use result::{OnlineResult, INIT_CB, PROB_DELTA, RECENT_WINDOW};
pub use runner::OnlineTrialRunner;
pub use scheduler::{
    ChaChaScheduler, Decision, OnlineScheduler, SuccessiveDoublingScheduler, TrialScheduler,
};
pub use service::{TunerHandle, TunerService, DEFAULT_QUEUE_CAPACITY};
pub use trial::{Trial, TrialSnapshot, TrialStatus, COST_UNIT};
pub use tuner::{AutoTuner, TunerSnapshot};
