//! Policies and configuration for the online tuning engine.
//!
//! Policy names such as `"loss_ucb"` or `"mae_clipped"` are parsed once, at the
//! configuration boundary, into the closed enums below.

use ot_search::SearchSpace;
use ot_types::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::trial::COST_UNIT;

fn unknown(kind: &str, name: &str) -> ConfigError {
    ConfigError::UnknownPolicy {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// Which statistic of a trial's loss is used as its score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorePolicy {
    /// Lower confidence bound: `loss_avg - ratio * cb`.
    Lcb,
    /// Upper confidence bound: `loss_avg + ratio * cb`.
    Ucb,
    Avg,
    /// Mean over the recent-loss window.
    AvgRecent,
}

impl FromStr for ScorePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches("loss_") {
            "lcb" => Ok(Self::Lcb),
            "ucb" => Ok(Self::Ucb),
            "avg" => Ok(Self::Avg),
            "avg_recent" => Ok(Self::AvgRecent),
            _ => Err(unknown("score", s)),
        }
    }
}

/// Statistical test used to decide whether a challenger beats the champion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChampionTest {
    /// Challenger's upper bound below the champion's `lower bound - cb`.
    Ucb,
    /// Challenger's running mean below the champion's.
    Avg,
}

impl ChampionTest {
    /// Score used to rank challengers before testing the best one.
    pub fn ranking_score(self) -> ScorePolicy {
        match self {
            Self::Ucb => ScorePolicy::Ucb,
            Self::Avg => ScorePolicy::Avg,
        }
    }
}

impl FromStr for ChampionTest {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches("loss_") {
            "ucb" => Ok(Self::Ucb),
            "avg" => Ok(Self::Avg),
            "martingale" => Err(ConfigError::Unsupported {
                kind: "champion test".to_string(),
                name: s.to_string(),
            }),
            _ => Err(unknown("champion test", s)),
        }
    }
}

/// Per-sample loss between a prediction and the true label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossMetric {
    #[serde(rename = "mse")]
    Squared,
    #[serde(rename = "mae")]
    Absolute,
    #[serde(rename = "mse_clipped")]
    SquaredClipped,
    #[serde(rename = "mae_clipped")]
    AbsoluteClipped,
}

impl LossMetric {
    /// Fixed confidence-bound coefficient of the squared-error family.
    pub const SQUARED_CB_COEF: f64 = 0.001;
    /// Default confidence-bound coefficient of the absolute-error family.
    pub const ABSOLUTE_CB_COEF: f64 = 0.05;

    pub fn is_squared(self) -> bool {
        matches!(self, Self::Squared | Self::SquaredClipped)
    }

    pub fn is_clipped(self) -> bool {
        matches!(self, Self::SquaredClipped | Self::AbsoluteClipped)
    }

    /// Coefficient of the confidence bound; `configured` only applies to the
    /// absolute-error family.
    pub fn cb_coef(self, configured: Option<f64>) -> f64 {
        if self.is_squared() {
            Self::SQUARED_CB_COEF
        } else {
            configured.unwrap_or(Self::ABSOLUTE_CB_COEF)
        }
    }

    /// Loss of `predicted` against `label`. Clipped metrics first clamp the
    /// prediction into the observed label range `[y_min, y_max]`.
    pub fn loss(self, label: f64, predicted: f64, y_min: f64, y_max: f64) -> f64 {
        let predicted = if self.is_clipped() && y_min <= y_max {
            predicted.clamp(y_min, y_max)
        } else {
            predicted
        };
        let diff = label - predicted;
        if self.is_squared() {
            diff * diff
        } else {
            diff.abs()
        }
    }
}

impl Default for LossMetric {
    fn default() -> Self {
        Self::AbsoluteClipped
    }
}

impl FromStr for LossMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mse" | "squared" => Ok(Self::Squared),
            "mae" | "absolute" => Ok(Self::Absolute),
            "mse_clipped" | "squared_clipped" => Ok(Self::SquaredClipped),
            "mae_clipped" | "absolute_clipped" => Ok(Self::AbsoluteClipped),
            _ => Err(unknown("loss metric", s)),
        }
    }
}

/// Minimum resource lease granted to a new trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLease {
    /// `feature dimension * 5`, resolved at the first trained sample and
    /// never below one sample's cost.
    Auto,
    Fixed(f64),
}

impl ResourceLease {
    pub const AUTO_MULTIPLIER: f64 = 5.0;

    pub fn resolve(self, dimension: f64) -> f64 {
        match self {
            Self::Auto => (dimension * Self::AUTO_MULTIPLIER).max(COST_UNIT),
            Self::Fixed(lease) => lease,
        }
    }
}

impl Default for ResourceLease {
    fn default() -> Self {
        Self::Auto
    }
}

/// How many of the running trials count as "top".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepRatio {
    /// `ceil(running * fraction)` trials.
    Fraction(f64),
    /// Only the single best trial.
    Best,
}

impl KeepRatio {
    pub fn top_number(self, running: usize) -> usize {
        match self {
            Self::Fraction(f) => (running as f64 * f).ceil() as usize,
            Self::Best => 1,
        }
    }
}

/// Whether the facade picks the trial with the smallest or largest score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Min,
    Max,
}

impl Default for SelectionMode {
    fn default() -> Self {
        Self::Min
    }
}

/// How the facade chooses the running trial that answers a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSelectPolicy {
    pub score: ScorePolicy,
    /// Ignore trials whose resource use is below the warm-start threshold.
    pub threshold: bool,
}

impl Default for ModelSelectPolicy {
    fn default() -> Self {
        Self {
            score: ScorePolicy::Ucb,
            threshold: true,
        }
    }
}

impl FromStr for ModelSelectPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (threshold, rest) = match s.strip_prefix("threshold_") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let score = rest
            .parse::<ScorePolicy>()
            .map_err(|_| unknown("model selection", s))?;
        Ok(Self { score, threshold })
    }
}

/// Per-trial settings shared by every trial the engine creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialArgs {
    pub metric: LossMetric,
    pub min_resource_lease: ResourceLease,
    /// Confidence-bound coefficient for the absolute-error family.
    pub cb_coef: Option<f64>,
}

impl Default for TrialArgs {
    fn default() -> Self {
        Self {
            metric: LossMetric::default(),
            min_resource_lease: ResourceLease::Auto,
            cb_coef: None,
        }
    }
}

impl TrialArgs {
    pub fn with_metric(mut self, metric: LossMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_min_resource_lease(mut self, lease: ResourceLease) -> Self {
        self.min_resource_lease = lease;
        self
    }

    pub fn with_cb_coef(mut self, coef: f64) -> Self {
        self.cb_coef = Some(coef);
        self
    }
}

/// Settings of the trial runner's control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of concurrently running trials.
    pub max_live_model_num: usize,
    pub champion_test: ChampionTest,
    /// Terminate trials that are confidently worse than the champion.
    pub remove_worse: bool,
    /// Cap the non-terminated trial count at
    /// `round((log10(steps) + 1) * first pool size)`.
    pub bound_trial_num: bool,
    /// Resource a trial must consume before it takes part in tests.
    pub warmstart_num: f64,
    /// Keep models of paused trials instead of dropping them.
    pub model_persistence: bool,
    /// Seed of the tie-breaking RNG.
    pub seed: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_live_model_num: 5,
            champion_test: ChampionTest::Ucb,
            remove_worse: true,
            bound_trial_num: false,
            warmstart_num: 100.0,
            model_persistence: false,
            seed: 123_456,
        }
    }
}

impl RunnerConfig {
    pub fn new(max_live_model_num: usize) -> Self {
        Self {
            max_live_model_num,
            ..Self::default()
        }
    }

    pub fn with_champion_test(mut self, test: ChampionTest) -> Self {
        self.champion_test = test;
        self
    }

    pub fn with_remove_worse(mut self, remove_worse: bool) -> Self {
        self.remove_worse = remove_worse;
        self
    }

    pub fn with_bound_trial_num(mut self, bound: bool) -> Self {
        self.bound_trial_num = bound;
        self
    }

    pub fn with_warmstart_num(mut self, warmstart_num: f64) -> Self {
        self.warmstart_num = warmstart_num;
        self
    }

    pub fn with_model_persistence(mut self, persist: bool) -> Self {
        self.model_persistence = persist;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_live_model_num == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_live_model_num".to_string(),
                message: "at least one live model is required".to_string(),
            });
        }
        if !(self.warmstart_num >= 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "warmstart_num".to_string(),
                message: format!("must be non-negative, got {}", self.warmstart_num),
            });
        }
        Ok(())
    }
}

/// Settings of the champion-aware scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaChaConfig {
    /// Factor applied to a trial's lease each time it exhausts it.
    pub increase_factor: f64,
    /// Never pause the champion.
    pub keep_champion: bool,
    /// Keep the top running trials running even when their lease is spent.
    pub keep_challenger_ratio: Option<KeepRatio>,
    pub keep_challenger_metric: ScorePolicy,
    /// Pause trials generated under an earlier champion.
    pub pause_old_frontier: bool,
}

impl Default for ChaChaConfig {
    fn default() -> Self {
        Self {
            increase_factor: 2.0,
            keep_champion: true,
            keep_challenger_ratio: Some(KeepRatio::Fraction(0.5)),
            keep_challenger_metric: ScorePolicy::Ucb,
            pause_old_frontier: false,
        }
    }
}

impl ChaChaConfig {
    pub fn with_increase_factor(mut self, factor: f64) -> Self {
        self.increase_factor = factor;
        self
    }

    pub fn with_keep_champion(mut self, keep: bool) -> Self {
        self.keep_champion = keep;
        self
    }

    pub fn with_keep_challenger(mut self, ratio: Option<KeepRatio>, metric: ScorePolicy) -> Self {
        self.keep_challenger_ratio = ratio;
        self.keep_challenger_metric = metric;
        self
    }

    pub fn with_pause_old_frontier(mut self, pause: bool) -> Self {
        self.pause_old_frontier = pause;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.increase_factor >= 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "increase_factor".to_string(),
                message: format!("must be at least 1, got {}", self.increase_factor),
            });
        }
        if let Some(KeepRatio::Fraction(f)) = self.keep_challenger_ratio {
            if !(0.0..=1.0).contains(&f) {
                return Err(ConfigError::InvalidValue {
                    name: "keep_challenger_ratio".to_string(),
                    message: format!("must be within [0, 1], got {f}"),
                });
            }
        }
        Ok(())
    }
}

/// Settings of the challenger generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Order of the polynomial expansion of interaction terms.
    pub expansion_order: usize,
    /// Number of new interaction terms added per candidate.
    pub addition_num: usize,
    /// Number of numeric sub-configs harvested from the local searcher.
    pub numerical_num: usize,
    pub seed: u64,
    /// Pseudo-loss reported for the first seed point.
    pub pseudo_large_loss: f64,
    /// Each later seed reports the previous target times this factor.
    pub pseudo_loss_decay: f64,
    pub pseudo_metric: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            expansion_order: 2,
            addition_num: 1,
            numerical_num: 2,
            seed: 2345,
            pseudo_large_loss: 1e6,
            pseudo_loss_decay: 0.95,
            pseudo_metric: "pseudo_loss".to_string(),
        }
    }
}

impl OracleConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_expansion_order(mut self, order: usize) -> Self {
        self.expansion_order = order;
        self
    }

    pub fn with_numerical_num(mut self, n: usize) -> Self {
        self.numerical_num = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addition_num == 0 {
            return Err(ConfigError::InvalidValue {
                name: "addition_num".to_string(),
                message: "must add at least one interaction term".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration of an [`AutoTuner`](crate::AutoTuner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerConfig {
    pub search_space: SearchSpace,
    /// Seed configuration; missing keys take the search space's seed values.
    pub init_config: Config,
    pub trial_args: TrialArgs,
    pub runner: RunnerConfig,
    pub scheduler: ChaChaConfig,
    pub oracle: OracleConfig,
    pub model_select_policy: ModelSelectPolicy,
    pub model_selection_mode: SelectionMode,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            search_space: SearchSpace::new().add_auto_interactions(ot_learner::INTERACTIONS_KEY),
            init_config: Config::new(),
            trial_args: TrialArgs::default(),
            runner: RunnerConfig::default(),
            scheduler: ChaChaConfig::default(),
            oracle: OracleConfig::default(),
            model_select_policy: ModelSelectPolicy::default(),
            model_selection_mode: SelectionMode::Min,
        }
    }
}

impl TunerConfig {
    pub fn new(max_live_model_num: usize, search_space: SearchSpace) -> Self {
        Self {
            search_space,
            runner: RunnerConfig::new(max_live_model_num),
            ..Self::default()
        }
    }

    pub fn with_init_config(mut self, config: Config) -> Self {
        self.init_config = config;
        self
    }

    pub fn with_trial_args(mut self, args: TrialArgs) -> Self {
        self.trial_args = args;
        self
    }

    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_scheduler(mut self, scheduler: ChaChaConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_oracle(mut self, oracle: OracleConfig) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_model_selection(mut self, policy: ModelSelectPolicy, mode: SelectionMode) -> Self {
        self.model_select_policy = policy;
        self.model_selection_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runner.validate()?;
        self.scheduler.validate()?;
        self.oracle.validate()?;
        self.search_space
            .validate()
            .map_err(|e| ConfigError::Invalid { message: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_policy_parsing() {
        assert_eq!("ucb".parse::<ScorePolicy>().unwrap(), ScorePolicy::Ucb);
        assert_eq!("loss_lcb".parse::<ScorePolicy>().unwrap(), ScorePolicy::Lcb);
        assert_eq!("loss_avg".parse::<ScorePolicy>().unwrap(), ScorePolicy::Avg);
        assert!("median".parse::<ScorePolicy>().is_err());
    }

    #[test]
    fn martingale_is_explicitly_unsupported() {
        assert!(matches!(
            "martingale".parse::<ChampionTest>(),
            Err(ConfigError::Unsupported { .. })
        ));
        assert_eq!("loss_ucb".parse::<ChampionTest>().unwrap(), ChampionTest::Ucb);
        assert!(matches!(
            "bogus".parse::<ChampionTest>(),
            Err(ConfigError::UnknownPolicy { .. })
        ));
    }

    #[test]
    fn model_select_policy_parsing() {
        let policy: ModelSelectPolicy = "threshold_loss_ucb".parse().unwrap();
        assert!(policy.threshold);
        assert_eq!(policy.score, ScorePolicy::Ucb);

        let policy: ModelSelectPolicy = "loss_avg".parse().unwrap();
        assert!(!policy.threshold);
        assert_eq!(policy.score, ScorePolicy::Avg);
    }

    #[test]
    fn loss_metrics() {
        let mae: LossMetric = "mae_clipped".parse().unwrap();
        // prediction clamped into [0, 1] before the loss
        assert!((mae.loss(1.0, 3.0, 0.0, 1.0) - 0.0).abs() < 1e-12);
        assert!((LossMetric::Absolute.loss(1.0, 3.0, 0.0, 1.0) - 2.0).abs() < 1e-12);
        assert!((LossMetric::Squared.loss(1.0, 3.0, 0.0, 1.0) - 4.0).abs() < 1e-12);
        assert!((LossMetric::SquaredClipped.loss(0.0, -2.0, 0.0, 1.0) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn cb_coefficients_by_family() {
        assert_eq!(LossMetric::Squared.cb_coef(Some(0.3)), LossMetric::SQUARED_CB_COEF);
        assert_eq!(LossMetric::Absolute.cb_coef(None), LossMetric::ABSOLUTE_CB_COEF);
        assert_eq!(LossMetric::AbsoluteClipped.cb_coef(Some(0.3)), 0.3);
    }

    #[test]
    fn resource_lease_resolution() {
        assert_eq!(ResourceLease::Auto.resolve(20.0), 100.0);
        assert_eq!(ResourceLease::Fixed(7.0).resolve(20.0), 7.0);
        // a featureless first sample still leaves room to train
        assert_eq!(ResourceLease::Auto.resolve(0.0), COST_UNIT);
    }

    #[test]
    fn keep_ratio_top_number() {
        assert_eq!(KeepRatio::Fraction(0.5).top_number(5), 3);
        assert_eq!(KeepRatio::Fraction(0.0).top_number(5), 0);
        assert_eq!(KeepRatio::Best.top_number(5), 1);
    }

    #[test]
    fn config_validation() {
        assert!(TunerConfig::default().validate().is_ok());
        assert!(RunnerConfig::new(0).validate().is_err());
        assert!(ChaChaConfig::default().with_increase_factor(0.5).validate().is_err());
        let bad_ratio = ChaChaConfig::default()
            .with_keep_challenger(Some(KeepRatio::Fraction(1.5)), ScorePolicy::Ucb);
        assert!(bad_ratio.validate().is_err());
    }

    #[test]
    fn tuner_config_round_trip() {
        let config = TunerConfig::new(3, SearchSpace::new().add_float("lr", 0.1, 1.0))
            .with_trial_args(TrialArgs::default().with_metric(LossMetric::Squared));
        let json = serde_json::to_string(&config).unwrap();
        let back: TunerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
