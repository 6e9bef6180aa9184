//! `AutoTuner`: the predict/learn facade over the trial runner.

use crossbeam_channel::Sender;
use ot_learner::LearnerFactory;
use ot_search::{LocalSearchFactory, ParameterKind, PerturbationSearchFactory, SearchSpace};
use ot_types::{Config, Sample, Signature, TuneError, TuneResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{SelectionMode, TunerConfig};
use crate::events::RunnerEvent;
use crate::oracle::ChampionFrontierSearcher;
use crate::runner::OnlineTrialRunner;
use crate::scheduler::ChaChaScheduler;
use crate::trial::{TrialSnapshot, TrialStatus};

/// Monitoring summary of a tuner session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerSnapshot {
    pub session_id: Uuid,
    pub iteration: u64,
    pub total_steps: u64,
    pub champion: Option<Signature>,
    pub champion_update_count: u64,
    pub last_selected: Option<Signature>,
    pub trials: Vec<TrialSnapshot>,
}

impl TunerSnapshot {
    pub fn to_json(&self) -> TuneResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Answers predictions with one running trial and feeds every labeled sample
/// to all of them.
///
/// The runner is built on the first sample, whose namespaces size the
/// interaction search space.
pub struct AutoTuner {
    config: TunerConfig,
    learner_factory: Arc<dyn LearnerFactory>,
    search_factory: Arc<dyn LocalSearchFactory>,
    event_tx: Option<Sender<RunnerEvent>>,
    runner: Option<OnlineTrialRunner>,
    session_id: Uuid,
    iteration: u64,
    last_selected: Option<Signature>,
    last_prediction: Option<(Signature, f64)>,
}

impl AutoTuner {
    pub fn new(config: TunerConfig, learner_factory: Arc<dyn LearnerFactory>) -> TuneResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            learner_factory,
            search_factory: Arc::new(PerturbationSearchFactory::default()),
            event_tx: None,
            runner: None,
            session_id: Uuid::new_v4(),
            iteration: 0,
            last_selected: None,
            last_prediction: None,
        })
    }

    pub fn with_local_search(mut self, factory: Arc<dyn LocalSearchFactory>) -> Self {
        self.search_factory = factory;
        self
    }

    /// Forward runner lifecycle events to `event_tx`.
    pub fn with_event_sink(mut self, event_tx: Sender<RunnerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Predict with the selected running trial and remember which one
    /// answered.
    pub fn predict(&mut self, sample: &Sample) -> TuneResult<f64> {
        self.ensure_runner(sample)?;
        let runner = self.runner.as_mut().ok_or_else(uninitialized)?;
        let selected = select_trial(
            runner,
            &self.config,
            self.last_selected.as_deref(),
        )
        .ok_or_else(|| ot_types::internal_error!("no trial is available to predict"))?;

        let value = runner.predict_with(&selected, sample)?;
        debug!(session = %self.session_id, trial = %selected, value, "prediction");
        self.last_prediction = Some((selected.clone(), value));
        self.last_selected = Some(selected);
        Ok(value)
    }

    /// Feed a labeled sample to every running trial.
    ///
    /// The trial that answered the preceding [`AutoTuner::predict`] reuses
    /// its prediction.
    pub fn learn(&mut self, sample: &Sample) -> TuneResult<()> {
        let prediction = self.last_prediction.take();
        self.ensure_runner(sample)?;
        let runner = self.runner.as_mut().ok_or_else(uninitialized)?;
        runner.step(
            Some(sample),
            prediction.as_ref().map(|(sig, value)| (sig.as_str(), *value)),
        )?;
        self.iteration += 1;
        Ok(())
    }

    fn ensure_runner(&mut self, sample: &Sample) -> TuneResult<()> {
        if self.runner.is_none() {
            self.runner = Some(self.build_runner(sample)?);
        }
        Ok(())
    }

    fn build_runner(&self, sample: &Sample) -> TuneResult<OnlineTrialRunner> {
        let space = expand_auto_interactions(&self.config.search_space, sample);
        let init_config = space.complete_config(&self.config.init_config);
        info!(
            session = %self.session_id,
            namespaces = sample.namespaces.len(),
            parameters = space.len(),
            "initializing tuner"
        );

        let oracle = ChampionFrontierSearcher::new(
            space,
            &init_config,
            self.config.oracle.clone(),
            self.config.trial_args.clone(),
            Arc::clone(&self.learner_factory),
            Arc::clone(&self.search_factory),
        )?;
        let scheduler = Box::new(ChaChaScheduler::new(self.config.scheduler.clone()));
        let runner_config = self.config.runner.clone();
        match &self.event_tx {
            Some(tx) => OnlineTrialRunner::with_event_sink(runner_config, scheduler, oracle, tx.clone()),
            None => OnlineTrialRunner::new(runner_config, scheduler, oracle),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Number of samples learned.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn is_initialized(&self) -> bool {
        self.runner.is_some()
    }

    pub fn runner(&self) -> Option<&OnlineTrialRunner> {
        self.runner.as_ref()
    }

    pub fn champion_config(&self) -> Option<&Config> {
        self.runner.as_ref()?.champion().map(|t| t.config())
    }

    pub fn last_selected(&self) -> Option<&str> {
        self.last_selected.as_deref()
    }

    pub fn snapshot(&self) -> TunerSnapshot {
        let runner = self.runner.as_ref();
        TunerSnapshot {
            session_id: self.session_id,
            iteration: self.iteration,
            total_steps: runner.map_or(0, |r| r.total_steps()),
            champion: runner.and_then(|r| r.champion()).map(|t| t.id().to_string()),
            champion_update_count: runner.map_or(0, |r| r.champion_update_count()),
            last_selected: self.last_selected.clone(),
            trials: runner.map_or_else(Vec::new, |r| r.trials().iter().map(|t| t.snapshot()).collect()),
        }
    }
}

fn uninitialized() -> TuneError {
    ot_types::internal_error!("runner was not initialized")
}

/// Replace every automatic interaction parameter with a polynomial expansion
/// over the sample's namespaces, up to one factor per namespace.
fn expand_auto_interactions(space: &SearchSpace, sample: &Sample) -> SearchSpace {
    let namespaces: BTreeSet<String> = sample.namespaces.keys().map(|ns| ns.to_string()).collect();
    let mut expanded = space.clone();
    for param in &mut expanded.parameters {
        if matches!(param.kind, ParameterKind::AutoInteractions) {
            param.kind = ParameterKind::PolynomialExpansion {
                highest_poly_order: Some(namespaces.len()),
                init_monomials: namespaces.clone(),
                allow_self_inter: false,
            };
        }
    }
    expanded
}

/// Pick the running trial that answers the next prediction.
///
/// Falls back to the previous selection while it keeps running, then to the
/// champion.
fn select_trial(
    runner: &OnlineTrialRunner,
    config: &TunerConfig,
    previous: Option<&str>,
) -> Option<Signature> {
    let policy = config.model_select_policy;
    let warmstart = runner.config().warmstart_num;
    let scored = runner.running_trials().into_iter().filter_map(|trial| {
        let result = trial.result()?;
        if policy.threshold && result.resource_used() < warmstart {
            return None;
        }
        Some((trial.id(), result.score(policy.score)))
    });
    let best = match config.model_selection_mode {
        SelectionMode::Min => scored.min_by(|a, b| a.1.total_cmp(&b.1)),
        SelectionMode::Max => scored.max_by(|a, b| a.1.total_cmp(&b.1)),
    };
    if let Some((id, _)) = best {
        return Some(id.to_string());
    }

    if let Some(previous) = previous {
        if runner
            .trial(previous)
            .is_some_and(|t| t.status() == TrialStatus::Running)
        {
            return Some(previous.to_string());
        }
    }
    runner.champion().map(|t| t.id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelSelectPolicy, RunnerConfig, ScorePolicy};
    use crate::runner::tests::sample;
    use crate::trial::tests::factory;
    use crossbeam_channel::unbounded;
    use ot_learner::INTERACTIONS_KEY;
    use ot_types::ParameterValue;

    fn tuner(max_live: usize) -> AutoTuner {
        let config = TunerConfig::new(
            max_live,
            SearchSpace::new().add_auto_interactions(INTERACTIONS_KEY),
        );
        AutoTuner::new(config, factory()).unwrap()
    }

    #[test]
    fn runner_is_built_on_first_sample() {
        let mut tuner = tuner(3);
        assert!(!tuner.is_initialized());
        assert!(tuner.champion_config().is_none());

        let value = tuner.predict(&sample(1)).unwrap();
        assert!(value.is_finite());
        assert!(tuner.is_initialized());

        let champion = tuner.champion_config().unwrap();
        assert_eq!(
            champion.get(INTERACTIONS_KEY),
            Some(&ParameterValue::Interactions(BTreeSet::new()))
        );
        // three namespaces leave room for all three pairwise challengers
        assert_eq!(tuner.runner().unwrap().running_trials().len(), 3);
    }

    #[test]
    fn auto_interactions_expand_over_sample_namespaces() {
        let space = SearchSpace::new()
            .add_float("learning_rate", 0.01, 1.0)
            .add_auto_interactions(INTERACTIONS_KEY);
        let expanded = expand_auto_interactions(&space, &sample(0));
        assert_eq!(expanded.len(), 2);
        match &expanded.get(INTERACTIONS_KEY).unwrap().kind {
            ParameterKind::PolynomialExpansion {
                init_monomials,
                highest_poly_order,
                allow_self_inter,
            } => {
                let expected: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
                assert_eq!(init_monomials, &expected);
                assert_eq!(*highest_poly_order, Some(3));
                assert!(!allow_self_inter);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(matches!(
            expanded.get("learning_rate").unwrap().kind,
            ParameterKind::FloatRange { .. }
        ));
    }

    #[test]
    fn falls_back_to_champion_before_warm_start() {
        let mut tuner = tuner(3);
        tuner.predict(&sample(0)).unwrap();
        let champion = tuner.runner().unwrap().champion().unwrap().id().to_string();
        assert_eq!(tuner.last_selected(), Some(champion.as_str()));
    }

    #[test]
    fn previous_selection_is_kept_while_running() {
        let config = TunerConfig::new(3, SearchSpace::new().add_auto_interactions(INTERACTIONS_KEY))
            .with_runner(RunnerConfig::new(3).with_warmstart_num(1e9));
        let mut tuner = AutoTuner::new(config, factory()).unwrap();
        tuner.predict(&sample(0)).unwrap();
        let first = tuner.last_selected().unwrap().to_string();
        for i in 0..20 {
            tuner.learn(&sample(i)).unwrap();
            tuner.predict(&sample(i + 1)).unwrap();
            assert_eq!(tuner.last_selected(), Some(first.as_str()));
        }
    }

    #[test]
    fn selects_by_score_past_warm_start() {
        let config = TunerConfig::new(3, SearchSpace::new().add_auto_interactions(INTERACTIONS_KEY))
            .with_runner(RunnerConfig::new(3).with_warmstart_num(5.0))
            .with_model_selection(
                ModelSelectPolicy {
                    score: ScorePolicy::Avg,
                    threshold: true,
                },
                SelectionMode::Min,
            );
        let mut tuner = AutoTuner::new(config, factory()).unwrap();
        for i in 0..50 {
            tuner.predict(&sample(i)).unwrap();
            tuner.learn(&sample(i)).unwrap();
        }
        tuner.predict(&sample(50)).unwrap();

        let runner = tuner.runner().unwrap();
        let best = runner
            .running_trials()
            .into_iter()
            .filter_map(|t| t.result().filter(|r| r.resource_used() >= 5.0).map(|r| (t.id(), r.loss_avg())))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id.to_string());
        if let Some(best) = best {
            assert_eq!(tuner.last_selected(), Some(best.as_str()));
        }
    }

    #[test]
    fn learn_before_predict_initializes() {
        let mut tuner = tuner(2);
        tuner.learn(&sample(0)).unwrap();
        assert!(tuner.is_initialized());
        assert_eq!(tuner.iteration(), 1);
        assert_eq!(tuner.runner().unwrap().total_steps(), 1);
    }

    #[test]
    fn unlabeled_sample_can_be_predicted_but_not_learned() {
        let mut tuner = tuner(2);
        let unlabeled = Sample::new(None).with_feature('a', "x", 1.0);
        assert!(tuner.predict(&unlabeled).is_ok());
        assert!(tuner.learn(&unlabeled).is_err());
        assert_eq!(tuner.iteration(), 0);
    }

    #[test]
    fn long_stream_snapshot() {
        let (tx, rx) = unbounded();
        let mut tuner = tuner(3).with_event_sink(tx);
        for i in 0..400 {
            tuner.predict(&sample(i)).unwrap();
            tuner.learn(&sample(i)).unwrap();
        }
        let snapshot = tuner.snapshot();
        assert_eq!(snapshot.iteration, 400);
        assert_eq!(snapshot.total_steps, 400);
        assert_eq!(snapshot.session_id, tuner.session_id());
        assert!(snapshot.champion.is_some());
        assert_eq!(snapshot.trials.iter().filter(|t| t.is_champion).count(), 1);
        assert!(rx.try_iter().count() >= 3);

        let json = snapshot.to_json().unwrap();
        let back: TunerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trials.len(), snapshot.trials.len());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = TunerConfig::new(0, SearchSpace::new().add_auto_interactions(INTERACTIONS_KEY));
        assert!(AutoTuner::new(config, factory()).is_err());
    }
}
