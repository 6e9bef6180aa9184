//! The online trial runner: one control-loop step per labeled sample.
//!
//! Each step trains every running trial on the sample, tests the best
//! challenger against the champion, evicts trials that are confidently worse,
//! applies the scheduler's pauses, then admits and schedules new challengers.

use crossbeam_channel::Sender;
use ot_types::{Sample, SampleError, Signature, TuneError, TuneResult};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::{ChampionTest, KeepRatio, RunnerConfig, ScorePolicy};
use crate::events::{RunnerEvent, RunnerEventKind};
use crate::oracle::ChampionFrontierSearcher;
use crate::pool::TrialPool;
use crate::scheduler::{Decision, TrialScheduler};
use crate::trial::{Trial, TrialStatus};

/// Owns every trial, the champion, the scheduler and the challenger oracle.
pub struct OnlineTrialRunner {
    config: RunnerConfig,
    pool: TrialPool,
    scheduler: Box<dyn TrialScheduler>,
    oracle: ChampionFrontierSearcher,
    total_steps: u64,
    champion_update_count: u64,
    first_challenger_pool_size: Option<usize>,
    best_challenger: Option<usize>,
    event_tx: Option<Sender<RunnerEvent>>,
}

impl OnlineTrialRunner {
    /// Create a runner and run one step without data, which admits the first
    /// challenger batch and makes the first trial champion.
    pub fn new(
        config: RunnerConfig,
        scheduler: Box<dyn TrialScheduler>,
        oracle: ChampionFrontierSearcher,
    ) -> TuneResult<Self> {
        Self::build(config, scheduler, oracle, None)
    }

    /// Like [`OnlineTrialRunner::new`], additionally emitting lifecycle
    /// events on `event_tx`. Sends are best-effort.
    pub fn with_event_sink(
        config: RunnerConfig,
        scheduler: Box<dyn TrialScheduler>,
        oracle: ChampionFrontierSearcher,
        event_tx: Sender<RunnerEvent>,
    ) -> TuneResult<Self> {
        Self::build(config, scheduler, oracle, Some(event_tx))
    }

    fn build(
        config: RunnerConfig,
        scheduler: Box<dyn TrialScheduler>,
        oracle: ChampionFrontierSearcher,
        event_tx: Option<Sender<RunnerEvent>>,
    ) -> TuneResult<Self> {
        config.validate()?;
        info!(
            max_live_model_num = config.max_live_model_num,
            scheduler = scheduler.name(),
            champion_test = ?config.champion_test,
            "starting online trial runner"
        );
        let mut runner = Self {
            pool: TrialPool::new(config.warmstart_num, config.seed),
            config,
            scheduler,
            oracle,
            total_steps: 0,
            champion_update_count: 0,
            first_challenger_pool_size: None,
            best_challenger: None,
            event_tx,
        };
        runner.step(None, None)?;
        Ok(runner)
    }

    /// Process one sample, or only admit and schedule when `sample` is `None`.
    ///
    /// `prediction` names the trial that already answered this sample and
    /// its value; that trial is trained against it instead of predicting
    /// again.
    pub fn step(&mut self, sample: Option<&Sample>, prediction: Option<(&str, f64)>) -> TuneResult<()> {
        if let Some(sample) = sample {
            if sample.label.is_none() {
                return Err(SampleError::MissingLabel.into());
            }
            self.total_steps += 1;

            let to_pause = self.update_running(sample, prediction);
            self.champion_test()?;
            // Pausing drops results the tests above rely on. A trial promoted
            // by the test keeps running.
            for idx in to_pause {
                if !self.pool.is_champion(idx) {
                    self.pause_trial(idx);
                }
            }
        }

        let open = self.open_slots();
        for _ in 0..open {
            self.add_trial_from_oracle()?;
        }

        for _ in 0..self.open_slots() {
            match self.scheduler.choose_trial_to_run(&self.pool) {
                Some(idx) => self.run_trial(idx),
                None => break,
            }
        }

        self.enforce_live_limit();
        Ok(())
    }

    fn open_slots(&self) -> usize {
        self.config
            .max_live_model_num
            .saturating_sub(self.pool.running_len())
    }

    /// Train every running trial on `sample` in parallel, then collect the
    /// scheduler's decisions in admission order. Returns the trials to pause.
    fn update_running(&mut self, sample: &Sample, prediction: Option<(&str, f64)>) -> Vec<usize> {
        let running: Vec<bool> = (0..self.pool.len()).map(|idx| self.pool.is_running(idx)).collect();

        let outcomes: Vec<(usize, TuneResult<f64>)> = self
            .pool
            .trials_mut()
            .par_iter_mut()
            .enumerate()
            .filter(|(idx, _)| running[*idx])
            .map(|(idx, trial)| {
                let predicted = match prediction {
                    Some((signature, value)) if signature == trial.id() => Ok(value),
                    _ => trial.predict(sample),
                };
                (idx, predicted.and_then(|p| trial.train_eval_online(sample, p)))
            })
            .collect();

        let mut to_pause = Vec::new();
        for (idx, outcome) in outcomes {
            let loss = match outcome {
                Ok(loss) => loss,
                Err(err) => {
                    self.fail_trial(idx, &err);
                    continue;
                }
            };

            let trial = self.pool.trial(idx);
            if let Some(result) = trial.result() {
                debug!(
                    trial = trial.id(),
                    loss,
                    loss_avg = result.loss_avg(),
                    loss_cb = result.loss_cb(),
                    resource_used = result.resource_used(),
                    "trial updated"
                );
                self.oracle.on_trial_result(trial.id(), result);
            }

            match self.scheduler.on_trial_result(&mut self.pool, idx) {
                Decision::Stop => self.stop_trial(idx),
                Decision::Pause => to_pause.push(idx),
                Decision::Continue => self.run_trial(idx),
            }
        }
        to_pause
    }

    /// Better-than test on the best challenger, then the optional
    /// worse-than test on every active trial.
    pub(crate) fn champion_test(&mut self) -> TuneResult<()> {
        let Some(champion) = self.pool.champion() else {
            return Ok(());
        };

        self.best_challenger = self.find_best_challenger(champion);
        if let Some(challenger) = self.best_challenger {
            let champion_failed = self.pool.trial(champion).status() == TrialStatus::Error;
            if champion_failed || self.better_than_champion(champion, challenger) {
                self.set_champion(challenger)?;
            }
        }

        if !self.config.remove_worse {
            return Ok(());
        }
        let Some(champion) = self.pool.champion() else {
            return Ok(());
        };
        let Some(champion_ucb) = self.pool.trial(champion).result().map(|r| r.loss_ucb()) else {
            return Ok(());
        };

        let warmstart = self.config.warmstart_num;
        let to_stop: Vec<usize> = self
            .pool
            .trials()
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.status().is_final())
            .filter(|(_, t)| {
                t.result()
                    .is_some_and(|r| r.resource_used() >= warmstart && r.loss_lcb() > champion_ucb)
            })
            .map(|(idx, _)| idx)
            .collect();

        // never shrink the active trials below the live-slot count
        let budget = self
            .pool
            .active_count()
            .saturating_sub(self.config.max_live_model_num);
        if to_stop.len() > budget {
            debug!(
                failing = to_stop.len(),
                evicting = budget,
                "worse-than test limited by live-slot floor"
            );
        }
        for idx in to_stop.into_iter().take(budget) {
            self.stop_trial(idx);
        }
        Ok(())
    }

    /// Lowest-scoring active non-champion trial with a result. Ties go to
    /// the first after a seeded shuffle.
    fn find_best_challenger(&mut self, champion: usize) -> Option<usize> {
        let mut candidates: Vec<usize> = self
            .pool
            .trials()
            .iter()
            .enumerate()
            .filter(|(idx, t)| *idx != champion && !t.status().is_final() && t.result().is_some())
            .map(|(idx, _)| idx)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        self.pool.shuffle(&mut candidates);

        let policy = self.config.champion_test.ranking_score();
        candidates
            .into_iter()
            .filter_map(|idx| self.pool.trial(idx).result().map(|r| (idx, r.score(policy))))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(idx, _)| idx)
    }

    fn better_than_champion(&self, champion: usize, challenger: usize) -> bool {
        let (Some(champ), Some(chall)) = (
            self.pool.trial(champion).result(),
            self.pool.trial(challenger).result(),
        ) else {
            return false;
        };
        if chall.resource_used() < self.config.warmstart_num {
            return false;
        }
        match self.config.champion_test {
            ChampionTest::Ucb => chall.loss_ucb() < champ.loss_lcb() - champ.loss_cb(),
            ChampionTest::Avg => chall.loss_avg() < champ.loss_avg(),
        }
    }

    fn add_trial_from_oracle(&mut self) -> TuneResult<()> {
        if self.config.bound_trial_num {
            if let Some(first_pool) = self.first_challenger_pool_size {
                let steps = self.total_steps.max(1) as f64;
                let upper = ((steps.log10() + 1.0) * first_pool as f64).round() as usize;
                if self.pool.active_count() > upper {
                    warn!(
                        active = self.pool.active_count(),
                        upper_bound = upper,
                        "trial count cap reached, not admitting challengers"
                    );
                    return Ok(());
                }
            }
        }

        let Some(trial) = self.oracle.next_trial() else {
            debug!("challenger pool exhausted");
            return Ok(());
        };
        let idx = self.add_trial(trial);
        if self.first_challenger_pool_size.is_none() {
            self.first_challenger_pool_size = Some(self.oracle.pool_len());
        }
        if self.pool.champion().is_none() {
            self.set_champion(idx)?;
        }
        Ok(())
    }

    /// Add a trial, or refresh the existing trial with the same signature.
    pub fn add_trial(&mut self, trial: Trial) -> usize {
        match self.pool.insert(trial) {
            Ok(idx) => {
                info!(trial = self.pool.trial(idx).id(), "trial added");
                self.scheduler.on_trial_add(&self.pool, idx);
                self.emit(idx, RunnerEventKind::TrialAdded);
                idx
            }
            Err(existing) => {
                self.pool
                    .trial_mut(existing)
                    .set_checked_under_current_champion(true);
                existing
            }
        }
    }

    fn set_champion(&mut self, idx: usize) -> TuneResult<()> {
        let initial = self.pool.champion().is_none();
        self.run_trial(idx);
        for (i, trial) in self.pool.trials_mut().iter_mut().enumerate() {
            trial.set_checked_under_current_champion(i == idx);
        }
        let previous = self.pool.set_champion(idx).map(|p| self.pool.trial(p).id().to_string());

        info!(
            champion = self.pool.trial(idx).id(),
            previous = previous.as_deref().unwrap_or("none"),
            "champion set"
        );
        self.emit(idx, RunnerEventKind::ChampionChanged { previous });

        // The oracle already generated around the initial config.
        if !initial {
            self.champion_update_count += 1;
            self.oracle.set_champion(self.pool.trial(idx))?;
        }
        Ok(())
    }

    pub fn stop_trial(&mut self, idx: usize) {
        let trial = self.pool.trial_mut(idx);
        if trial.status().is_final() {
            return;
        }
        trial.set_status(TrialStatus::Terminated);
        trial.clean_up_model();
        info!(trial = trial.id(), "trial terminated");

        self.scheduler.on_trial_remove(&self.pool, idx);
        self.oracle.on_trial_complete(self.pool.trial(idx).id());
        self.pool.mark_stopped(idx);
        self.emit(idx, RunnerEventKind::TrialTerminated);
    }

    pub fn pause_trial(&mut self, idx: usize) {
        let persist = self.config.model_persistence;
        let trial = self.pool.trial_mut(idx);
        if trial.status().is_final() {
            return;
        }
        trial.set_status(TrialStatus::Paused);
        if !persist {
            trial.clean_up_model();
        }
        info!(
            trial = trial.id(),
            resource_lease = trial.resource_lease(),
            "trial paused"
        );
        self.pool.mark_stopped(idx);
        self.emit(idx, RunnerEventKind::TrialPaused);
    }

    pub fn run_trial(&mut self, idx: usize) {
        let trial = self.pool.trial_mut(idx);
        if trial.status().is_final() {
            return;
        }
        let was_running = trial.status() == TrialStatus::Running;
        trial.set_status(TrialStatus::Running);
        self.pool.mark_running(idx);
        if !was_running {
            debug!(trial = self.pool.trial(idx).id(), "trial started");
            self.emit(idx, RunnerEventKind::TrialStarted);
        }
    }

    /// A trial whose model cannot be built leaves the running set for good.
    fn fail_trial(&mut self, idx: usize, err: &TuneError) {
        let trial = self.pool.trial_mut(idx);
        error!(trial = trial.id(), error = %err, "trial failed");
        trial.set_status(TrialStatus::Error);
        trial.clean_up_model();
        self.oracle.on_trial_complete(self.pool.trial(idx).id());
        self.pool.mark_stopped(idx);
        self.emit(idx, RunnerEventKind::TrialFailed {
            message: err.to_string(),
        });
    }

    /// Pause the worst non-champion trials if a promotion pushed the running
    /// set over its limit.
    fn enforce_live_limit(&mut self) {
        let policy = self.config.champion_test.ranking_score();
        while self.pool.running_len() > self.config.max_live_model_num {
            let worst = self
                .pool
                .running()
                .filter(|&idx| !self.pool.is_champion(idx))
                .map(|idx| {
                    let score = self
                        .pool
                        .trial(idx)
                        .result()
                        .map_or(f64::INFINITY, |r| r.score(policy));
                    (idx, score)
                })
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(idx, _)| idx);
            match worst {
                Some(idx) => self.pause_trial(idx),
                None => break,
            }
        }
    }

    /// Predict with one trial. A trial whose model fails to build is marked
    /// `Error` and the failure is returned.
    pub fn predict_with(&mut self, signature: &str, sample: &Sample) -> TuneResult<f64> {
        let idx = self
            .pool
            .find(signature)
            .ok_or_else(|| ot_types::validation_error!("unknown trial {signature}"))?;
        match self.pool.trial_mut(idx).predict(sample) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.fail_trial(idx, &err);
                Err(err)
            }
        }
    }

    fn emit(&self, idx: usize, kind: RunnerEventKind) {
        if let Some(tx) = &self.event_tx {
            let event = RunnerEvent::new(self.total_steps, self.pool.trial(idx).id(), kind);
            let _ = tx.try_send(event);
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn trials(&self) -> &[Trial] {
        self.pool.trials()
    }

    pub fn trial(&self, signature: &str) -> Option<&Trial> {
        self.pool.find(signature).map(|idx| self.pool.trial(idx))
    }

    pub fn running_trials(&self) -> Vec<&Trial> {
        self.pool.running().map(|idx| self.pool.trial(idx)).collect()
    }

    pub fn champion(&self) -> Option<&Trial> {
        self.pool.champion().map(|idx| self.pool.trial(idx))
    }

    /// Challenger chosen by the last champion test.
    pub fn best_challenger(&self) -> Option<&Trial> {
        self.best_challenger.map(|idx| self.pool.trial(idx))
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn champion_update_count(&self) -> u64 {
        self.champion_update_count
    }

    pub fn top_running_trials(&mut self, ratio: Option<KeepRatio>, metric: ScorePolicy) -> Vec<Signature> {
        self.pool
            .top_running_trials(ratio, metric)
            .into_iter()
            .map(|idx| self.pool.trial(idx).id().to_string())
            .collect()
    }

    pub fn pool(&self) -> &TrialPool {
        &self.pool
    }

    pub fn oracle(&self) -> &ChampionFrontierSearcher {
        &self.oracle
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.scheduler.name()
    }
}
