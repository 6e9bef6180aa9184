//! Local search around a seed configuration.

use ot_types::{Config, ParameterValue, SearchError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::space::{ParameterKind, SearchSpace};

/// Properties pushed into a local searcher after construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchProperties {
    /// Name of the metric to read out of completed results.
    pub metric: Option<String>,
    /// Loss the searcher should consider the current best.
    pub metric_target: Option<f64>,
}

/// Proposes numeric and categorical hyperparameter values near a seed point.
///
/// Proposals are addressed by an opaque trial id. Returning `None` from
/// [`LocalSearcher::suggest`] means the searcher has nothing to offer right
/// now; it is not an error.
pub trait LocalSearcher: Send {
    fn set_search_properties(&mut self, properties: &SearchProperties) -> bool;

    fn suggest(&mut self, trial_id: &str) -> Option<Config>;

    fn on_trial_complete(
        &mut self,
        trial_id: &str,
        result: Option<&HashMap<String, f64>>,
        is_error: bool,
    );

    /// Best loss reported so far, if any.
    fn metric_target(&self) -> Option<f64>;

    fn name(&self) -> &str;
}

/// Builds one local searcher per seed configuration.
pub trait LocalSearchFactory: Send + Sync {
    fn create(
        &self,
        space: &SearchSpace,
        points_to_evaluate: Vec<Config>,
        metric: &str,
        seed: u64,
    ) -> Result<Box<dyn LocalSearcher>, SearchError>;
}

/// Randomized direct search in the normalized unit cube.
///
/// Each proposal moves the incumbent by `step` along a random direction; the
/// following proposal tries the opposite direction. When `2 * dim`
/// consecutive proposals fail to improve the incumbent the step is halved,
/// and once it falls below `step_lower_bound` the searcher is exhausted.
///
/// A categorical dimension owns one equal-width cell of the unit interval per
/// choice. A move that stays inside the current cell switches to a random
/// other choice with probability `step * |d| * choices`, and a proposal that
/// would repeat the incumbent switches its most-moved categorical dimension.
pub struct PerturbationSearch {
    space: SearchSpace,
    metric: String,
    points_to_evaluate: VecDeque<Config>,
    proposals: HashMap<String, Config>,
    incumbent: Option<Config>,
    metric_target: Option<f64>,
    step: f64,
    step_lower_bound: f64,
    failures: usize,
    pending_direction: Option<Vec<f64>>,
    rng: StdRng,
}

impl PerturbationSearch {
    pub fn new(
        space: SearchSpace,
        points_to_evaluate: Vec<Config>,
        metric: impl Into<String>,
        seed: u64,
    ) -> Result<Self, SearchError> {
        let space = space.local_subspace();
        if space.is_empty() {
            return Err(SearchError::NoDimensions);
        }
        space.validate()?;
        for point in &points_to_evaluate {
            if let Some(name) = point.keys().find(|k| space.get(k).is_none()) {
                return Err(SearchError::UnknownParameter { name: name.clone() });
            }
        }
        let dim = space.len() as f64;
        Ok(Self {
            space,
            metric: metric.into(),
            points_to_evaluate: points_to_evaluate.into(),
            proposals: HashMap::new(),
            incumbent: None,
            metric_target: None,
            step: 0.1 * dim.sqrt(),
            step_lower_bound: 1e-3,
            failures: 0,
            pending_direction: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn with_step(mut self, step: f64, step_lower_bound: f64) -> Self {
        self.step = step;
        self.step_lower_bound = step_lower_bound;
        self
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn incumbent(&self) -> Option<&Config> {
        self.incumbent.as_ref()
    }

    fn normalize(&self, config: &Config) -> Vec<f64> {
        self.space
            .parameters
            .iter()
            .map(|param| {
                if let ParameterKind::Choice { values } = &param.kind {
                    let index = match config.get(&param.name) {
                        Some(ParameterValue::Json(v)) => values.iter().position(|c| c == v),
                        _ => None,
                    };
                    return category_center(index.unwrap_or(0), values.len());
                }
                let value = config.get(&param.name).and_then(ParameterValue::as_f64);
                match (&param.kind, value) {
                    (ParameterKind::FloatRange { low, high }, Some(v)) => {
                        unit(v - low, high - low)
                    }
                    (ParameterKind::IntRange { low, high }, Some(v)) => {
                        unit(v - *low as f64, (*high - *low) as f64)
                    }
                    (ParameterKind::LogUniform { low, high }, Some(v)) if v > 0.0 => {
                        unit(v.ln() - low.ln(), high.ln() - low.ln())
                    }
                    _ => 0.0,
                }
            })
            .collect()
    }

    fn denormalize(&self, point: &[f64]) -> Config {
        self.space
            .parameters
            .iter()
            .zip(point)
            .filter_map(|(param, t)| {
                let t = t.clamp(0.0, 1.0);
                let value = match &param.kind {
                    ParameterKind::FloatRange { low, high } => {
                        ParameterValue::Float(low + t * (high - low))
                    }
                    ParameterKind::IntRange { low, high } => {
                        let span = (*high - *low) as f64;
                        ParameterValue::Int(*low + (t * span).round() as i64)
                    }
                    ParameterKind::LogUniform { low, high } => {
                        let log_v = low.ln() + t * (high.ln() - low.ln());
                        ParameterValue::Float(log_v.exp().clamp(*low, *high))
                    }
                    ParameterKind::Choice { values } => {
                        let choice = values.get(category_index(t, values.len()))?;
                        ParameterValue::Json(choice.clone())
                    }
                    _ => return None,
                };
                Some((param.name.clone(), value))
            })
            .collect()
    }

    /// Give categorical dimensions that stayed in their cell a chance to
    /// switch choice.
    fn switch_categories(&mut self, origin: &[f64], direction: &[f64], moved: &mut [f64]) {
        for (i, param) in self.space.parameters.iter().enumerate() {
            let ParameterKind::Choice { values } = &param.kind else {
                continue;
            };
            let k = values.len();
            let from = category_index(origin[i], k);
            if k < 2 || category_index(moved[i], k) != from {
                continue;
            }
            let p = (self.step * direction[i].abs() * k as f64).min(1.0);
            if self.rng.random_bool(p) {
                moved[i] = category_center(other_category(&mut self.rng, from, k), k);
            }
        }
    }

    /// Switch the categorical dimension with the largest move, if any.
    fn force_category_switch(&mut self, origin: &[f64], direction: &[f64], moved: &mut [f64]) -> bool {
        let strongest = self
            .space
            .parameters
            .iter()
            .enumerate()
            .filter_map(|(i, param)| match &param.kind {
                ParameterKind::Choice { values } if values.len() > 1 => Some((i, values.len())),
                _ => None,
            })
            .max_by(|(a, _), (b, _)| direction[*a].abs().total_cmp(&direction[*b].abs()));
        let Some((i, k)) = strongest else {
            return false;
        };
        let from = category_index(origin[i], k);
        moved[i] = category_center(other_category(&mut self.rng, from, k), k);
        true
    }

    fn random_direction(&mut self, dim: usize) -> Vec<f64> {
        loop {
            let direction: Vec<f64> = (0..dim).map(|_| self.rng.random_range(-1.0..=1.0)).collect();
            let norm = direction.iter().map(|d| d * d).sum::<f64>().sqrt();
            if norm > 1e-12 {
                return direction.into_iter().map(|d| d / norm).collect();
            }
        }
    }
}

fn category_index(t: f64, choices: usize) -> usize {
    ((t.clamp(0.0, 1.0) * choices as f64) as usize).min(choices.saturating_sub(1))
}

fn category_center(index: usize, choices: usize) -> f64 {
    (index as f64 + 0.5) / choices.max(1) as f64
}

/// Uniformly pick a choice other than `current`. Needs `choices >= 2`.
fn other_category(rng: &mut StdRng, current: usize, choices: usize) -> usize {
    let pick = rng.random_range(0..choices - 1);
    if pick >= current {
        pick + 1
    } else {
        pick
    }
}

fn unit(offset: f64, span: f64) -> f64 {
    if span > 0.0 {
        (offset / span).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl LocalSearcher for PerturbationSearch {
    fn set_search_properties(&mut self, properties: &SearchProperties) -> bool {
        if let Some(metric) = &properties.metric {
            self.metric = metric.clone();
        }
        if properties.metric_target.is_some() {
            self.metric_target = properties.metric_target;
        }
        true
    }

    fn suggest(&mut self, trial_id: &str) -> Option<Config> {
        if let Some(point) = self.points_to_evaluate.pop_front() {
            self.proposals.insert(trial_id.to_string(), point.clone());
            return Some(point);
        }

        let incumbent = self.incumbent.clone()?;
        if self.step < self.step_lower_bound {
            debug!(step = self.step, "local search converged");
            return None;
        }

        let origin = self.normalize(&incumbent);
        let direction = match self.pending_direction.take() {
            Some(opposite) => opposite,
            None => {
                let direction = self.random_direction(origin.len());
                self.pending_direction = Some(direction.iter().map(|d| -d).collect());
                direction
            }
        };
        let mut moved: Vec<f64> = origin
            .iter()
            .zip(&direction)
            .map(|(o, d)| o + self.step * d)
            .collect();
        self.switch_categories(&origin, &direction, &mut moved);

        let mut proposal = self.denormalize(&moved);
        if proposal == incumbent && self.force_category_switch(&origin, &direction, &mut moved) {
            proposal = self.denormalize(&moved);
        }
        self.proposals.insert(trial_id.to_string(), proposal.clone());
        Some(proposal)
    }

    fn on_trial_complete(
        &mut self,
        trial_id: &str,
        result: Option<&HashMap<String, f64>>,
        is_error: bool,
    ) {
        let Some(config) = self.proposals.remove(trial_id) else {
            return;
        };
        if is_error {
            return;
        }
        let Some(loss) = result.and_then(|r| r.get(&self.metric)).copied() else {
            return;
        };

        let improved = match (&self.incumbent, self.metric_target) {
            (None, _) => true,
            (Some(_), Some(best)) => loss < best,
            (Some(_), None) => true,
        };
        if improved {
            self.incumbent = Some(config);
            self.metric_target = Some(loss);
            self.failures = 0;
            self.pending_direction = None;
        } else {
            self.failures += 1;
            if self.failures >= 2 * self.space.len() {
                self.step *= 0.5;
                self.failures = 0;
            }
        }
    }

    fn metric_target(&self) -> Option<f64> {
        self.metric_target
    }

    fn name(&self) -> &str {
        "perturbation"
    }
}

/// Factory for [`PerturbationSearch`] instances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerturbationSearchFactory {
    /// Initial step size in the normalized cube. `None` uses `0.1 * sqrt(dim)`.
    pub initial_step: Option<f64>,
    pub step_lower_bound: f64,
}

impl Default for PerturbationSearchFactory {
    fn default() -> Self {
        Self {
            initial_step: None,
            step_lower_bound: 1e-3,
        }
    }
}

impl LocalSearchFactory for PerturbationSearchFactory {
    fn create(
        &self,
        space: &SearchSpace,
        points_to_evaluate: Vec<Config>,
        metric: &str,
        seed: u64,
    ) -> Result<Box<dyn LocalSearcher>, SearchError> {
        let mut search = PerturbationSearch::new(space.clone(), points_to_evaluate, metric, seed)?;
        let step = self.initial_step.unwrap_or(search.step);
        search = search.with_step(step, self.step_lower_bound);
        Ok(Box::new(search))
    }
}
