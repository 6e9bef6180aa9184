//! Running loss statistics of a single trial.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::ScorePolicy;

/// Confidence parameter of the sample-complexity bound.
pub const PROB_DELTA: f64 = 0.1;
/// Confidence bound reported before any observation.
pub const INIT_CB: f64 = 100.0;
/// Capacity of the recent-loss window.
pub const RECENT_WINDOW: usize = 100;

const LOSS_MIN: f64 = 0.0;
const LOSS_MAX: f64 = f64::INFINITY;

/// Running statistics owned by exactly one trial.
///
/// `loss_avg` is an incremental weighted mean, never a raw sum, so it stays
/// finite over arbitrarily long streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineResult {
    observation_count: f64,
    resource_used: f64,
    loss_avg: f64,
    loss_cb: f64,
    cb_coef: f64,
    recent: VecDeque<f64>,
}

impl OnlineResult {
    pub fn new(cb_coef: f64) -> Self {
        Self {
            observation_count: 0.0,
            resource_used: 0.0,
            loss_avg: 0.0,
            loss_cb: INIT_CB,
            cb_coef,
            recent: VecDeque::with_capacity(RECENT_WINDOW),
        }
    }

    /// Fold one observation into the statistics.
    ///
    /// `range_bound` is the width of the observed label range; callers
    /// substitute 1.0 when it collapses to zero.
    pub fn update(
        &mut self,
        new_loss: f64,
        new_resource_used: f64,
        feature_dimension: f64,
        range_bound: f64,
        observation_weight: f64,
    ) {
        self.resource_used += new_resource_used;

        let n = self.observation_count;
        let total = n + observation_weight;
        if total > 0.0 {
            self.loss_avg = self.loss_avg * (n / total) + new_loss * (observation_weight / total);
            self.observation_count = total;
            self.loss_cb = self.confidence_bound(range_bound, feature_dimension);
        }

        if self.recent.len() == RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(new_loss);
    }

    /// `coef * range * sqrt(dim) * sqrt(log10(n / delta) / n)`.
    fn confidence_bound(&self, range_bound: f64, feature_dimension: f64) -> f64 {
        let n = self.observation_count;
        let complexity = feature_dimension.max(0.0).sqrt();
        let shrink = ((n / PROB_DELTA).log10() / n).max(0.0).sqrt();
        (self.cb_coef * range_bound.abs() * complexity * shrink).max(0.0)
    }

    pub fn observation_count(&self) -> f64 {
        self.observation_count
    }

    pub fn resource_used(&self) -> f64 {
        self.resource_used
    }

    pub fn loss_avg(&self) -> f64 {
        self.loss_avg
    }

    pub fn loss_cb(&self) -> f64 {
        self.loss_cb
    }

    pub fn loss_lcb(&self) -> f64 {
        (self.loss_avg - self.loss_cb).max(LOSS_MIN)
    }

    pub fn loss_ucb(&self) -> f64 {
        (self.loss_avg + self.loss_cb).min(LOSS_MAX)
    }

    /// Mean loss over the recent window (0 before any observation).
    pub fn loss_avg_recent(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.recent.iter().sum::<f64>() / self.recent.len() as f64
        }
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn score(&self, policy: ScorePolicy) -> f64 {
        self.score_with_ratio(policy, 1.0)
    }

    pub fn score_with_ratio(&self, policy: ScorePolicy, cb_ratio: f64) -> f64 {
        match policy {
            ScorePolicy::Lcb => (self.loss_avg - cb_ratio * self.loss_cb).max(LOSS_MIN),
            ScorePolicy::Ucb => (self.loss_avg + cb_ratio * self.loss_cb).min(LOSS_MAX),
            ScorePolicy::Avg => self.loss_avg,
            ScorePolicy::AvgRecent => self.loss_avg_recent(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(loss_avg: f64, loss_cb: f64, resource_used: f64) -> Self {
        Self {
            observation_count: resource_used,
            resource_used,
            loss_avg,
            loss_cb,
            cb_coef: crate::config::LossMetric::ABSOLUTE_CB_COEF,
            recent: VecDeque::from(vec![loss_avg]),
        }
    }
}
