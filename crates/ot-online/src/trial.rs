//! Trials: one configuration, its lifecycle, and the model it trains.

use chrono::{DateTime, Utc};
use ot_learner::{LearnerFactory, OnlineLearner};
use ot_types::{config_signature, Config, Sample, SampleError, Signature, TuneResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::TrialArgs;
use crate::result::OnlineResult;

/// Resource consumed by one trained sample.
pub const COST_UNIT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Paused,
    Terminated,
    Error,
}

impl TrialStatus {
    /// `Terminated` and `Error` are absorbing.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

/// Model and statistics, created together at the first sample.
struct ReadyModel {
    learner: Box<dyn OnlineLearner>,
    result: OnlineResult,
    dimension: f64,
}

enum ModelState {
    Uninitialized,
    Ready(ReadyModel),
}

/// A single configuration under evaluation.
pub struct Trial {
    id: Signature,
    config: Config,
    status: TrialStatus,
    args: TrialArgs,
    factory: Arc<dyn LearnerFactory>,
    resource_lease: Option<f64>,
    is_champion: bool,
    checked_under_current_champion: bool,
    state: ModelState,
    y_min: Option<f64>,
    y_max: Option<f64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl Trial {
    /// Create a pending trial. The configuration is validated against the
    /// learner factory up front; an unusable config is an error here rather
    /// than at the first sample.
    pub fn new(config: Config, args: TrialArgs, factory: Arc<dyn LearnerFactory>) -> TuneResult<Self> {
        factory.validate(&config)?;
        Ok(Self {
            id: config_signature(&config),
            config,
            status: TrialStatus::Pending,
            args,
            factory,
            resource_lease: None,
            is_champion: false,
            checked_under_current_champion: true,
            state: ModelState::Uninitialized,
            y_min: None,
            y_max: None,
            created_at: Utc::now(),
            started_at: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    /// Transition to `status`. Returns `false` (and does nothing) when the
    /// trial is already terminated or errored.
    pub fn set_status(&mut self, status: TrialStatus) -> bool {
        if self.status.is_final() {
            return false;
        }
        if status == TrialStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = status;
        true
    }

    /// Sample budget before the next scheduling checkpoint. Infinite until
    /// an automatic lease is resolved at the first sample.
    pub fn resource_lease(&self) -> f64 {
        self.resource_lease.unwrap_or(f64::INFINITY)
    }

    pub fn set_resource_lease(&mut self, lease: f64) {
        self.resource_lease = Some(lease);
    }

    pub fn is_champion(&self) -> bool {
        self.is_champion
    }

    pub(crate) fn set_champion(&mut self, is_champion: bool) {
        self.is_champion = is_champion;
    }

    pub fn is_checked_under_current_champion(&self) -> bool {
        self.checked_under_current_champion
    }

    pub fn set_checked_under_current_champion(&mut self, checked: bool) {
        self.checked_under_current_champion = checked;
    }

    pub fn result(&self) -> Option<&OnlineResult> {
        match &self.state {
            ModelState::Ready(ready) => Some(&ready.result),
            ModelState::Uninitialized => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, ModelState::Ready(_))
    }

    /// Feature dimension computed at initialization.
    pub fn dimension(&self) -> Option<f64> {
        match &self.state {
            ModelState::Ready(ready) => Some(ready.dimension),
            ModelState::Uninitialized => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Build the model and statistics if this is the first sample seen.
    fn ensure_initialized(&mut self, sample: &Sample) -> TuneResult<&mut ReadyModel> {
        if let ModelState::Uninitialized = self.state {
            let learner = self.factory.build(&self.config)?;
            let dimension = learner.feature_dimension(sample);
            let result = OnlineResult::new(self.args.metric.cb_coef(self.args.cb_coef));
            self.state = ModelState::Ready(ReadyModel {
                learner,
                result,
                dimension,
            });
        }
        match &mut self.state {
            ModelState::Ready(ready) => Ok(ready),
            ModelState::Uninitialized => Err(ot_types::internal_error!(
                "trial {} failed to initialize its model",
                self.id
            )),
        }
    }

    pub fn predict(&mut self, sample: &Sample) -> TuneResult<f64> {
        let ready = self.ensure_initialized(sample)?;
        Ok(ready.learner.predict(sample))
    }

    /// Score `predicted` against the sample's label, fold the loss into the
    /// result, then take one learning step. Returns the loss.
    pub fn train_eval_online(&mut self, sample: &Sample, predicted: f64) -> TuneResult<f64> {
        let label = sample.label.ok_or(SampleError::MissingLabel)?;
        self.y_min = Some(self.y_min.map_or(label, |m| m.min(label)));
        self.y_max = Some(self.y_max.map_or(label, |m| m.max(label)));
        let (y_min, y_max) = (self.y_min.unwrap_or(label), self.y_max.unwrap_or(label));

        let metric = self.args.metric;
        let min_lease = self.args.min_resource_lease;
        let ready = self.ensure_initialized(sample)?;
        let dimension = ready.dimension;

        ready.learner.learn(sample);

        let loss = metric.loss(label, predicted, y_min, y_max);
        let mut range_bound = y_max - y_min;
        if range_bound == 0.0 {
            range_bound = 1.0;
        }
        ready.result.update(loss, COST_UNIT, dimension, range_bound, 1.0);

        if self.resource_lease.is_none() {
            self.resource_lease = Some(min_lease.resolve(dimension));
        }
        Ok(loss)
    }

    /// Drop the model and its statistics.
    pub fn clean_up_model(&mut self) {
        self.state = ModelState::Uninitialized;
    }

    #[cfg(test)]
    pub(crate) fn force_result(&mut self, result: OnlineResult) -> TuneResult<()> {
        let learner = self.factory.build(&self.config)?;
        self.state = ModelState::Ready(ReadyModel {
            learner,
            result,
            dimension: 1.0,
        });
        Ok(())
    }

    pub fn snapshot(&self) -> TrialSnapshot {
        let result = self.result();
        TrialSnapshot {
            id: self.id.clone(),
            status: self.status,
            is_champion: self.is_champion,
            resource_lease: self.resource_lease,
            resource_used: result.map(OnlineResult::resource_used),
            loss_avg: result.map(OnlineResult::loss_avg),
            loss_cb: result.map(OnlineResult::loss_cb),
            started_at: self.started_at,
        }
    }
}

impl fmt::Debug for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trial")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("resource_lease", &self.resource_lease)
            .field("is_champion", &self.is_champion)
            .field("result", &self.result())
            .finish()
    }
}

/// Serializable view of a trial for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSnapshot {
    pub id: Signature,
    pub status: TrialStatus,
    pub is_champion: bool,
    pub resource_lease: Option<f64>,
    pub resource_used: Option<f64>,
    pub loss_avg: Option<f64>,
    pub loss_cb: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
}
