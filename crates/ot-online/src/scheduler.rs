//! Scheduling policies consulted by the trial runner.
//!
//! Schedulers are stateless: every decision is a function of the trial pool
//! handed to them, so policies can be swapped without migrating state.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ChaChaConfig;
use crate::pool::TrialPool;
use crate::trial::TrialStatus;

/// What the runner should do with a trial after it consumed a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Continue,
    Pause,
    Stop,
}

pub trait TrialScheduler: Send {
    fn on_trial_add(&self, _pool: &TrialPool, _trial: usize) {}

    /// Decide the trial's fate after its result was updated.
    fn on_trial_result(&self, pool: &mut TrialPool, trial: usize) -> Decision;

    fn on_trial_remove(&self, _pool: &TrialPool, _trial: usize) {}

    /// Pick a trial to fill an open slot: the first pending trial, otherwise
    /// the paused trial with the smallest resource lease.
    fn choose_trial_to_run(&self, pool: &TrialPool) -> Option<usize> {
        let trials = pool.trials();
        if let Some(idx) = trials.iter().position(|t| t.status() == TrialStatus::Pending) {
            return Some(idx);
        }
        trials
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status() == TrialStatus::Paused)
            // min_by keeps the earliest trial on ties
            .min_by(|(_, a), (_, b)| a.resource_lease().total_cmp(&b.resource_lease()))
            .map(|(idx, _)| idx)
    }

    fn name(&self) -> &'static str;
}

/// Lets every trial run indefinitely.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnlineScheduler;

impl TrialScheduler for OnlineScheduler {
    fn on_trial_result(&self, _pool: &mut TrialPool, _trial: usize) -> Decision {
        Decision::Continue
    }

    fn name(&self) -> &'static str {
        "online"
    }
}

/// Pauses a trial each time it spends its lease, multiplying the lease by
/// `increase_factor` for the next round.
#[derive(Debug, Clone, Copy)]
pub struct SuccessiveDoublingScheduler {
    increase_factor: f64,
}

impl SuccessiveDoublingScheduler {
    pub fn new(increase_factor: f64) -> Self {
        Self { increase_factor }
    }
}

impl Default for SuccessiveDoublingScheduler {
    fn default() -> Self {
        Self::new(2.0)
    }
}

impl TrialScheduler for SuccessiveDoublingScheduler {
    fn on_trial_result(&self, pool: &mut TrialPool, trial: usize) -> Decision {
        let trial = pool.trial_mut(trial);
        let lease = trial.resource_lease();
        let Some(used) = trial.result().map(|r| r.resource_used()) else {
            return Decision::Continue;
        };
        if used < lease {
            return Decision::Continue;
        }
        trial.set_resource_lease(lease * self.increase_factor);
        debug!(
            trial = trial.id(),
            resource_used = used,
            new_lease = lease * self.increase_factor,
            "resource lease spent"
        );
        Decision::Pause
    }

    fn name(&self) -> &'static str {
        "successive_doubling"
    }
}

/// Champion-aware successive doubling.
///
/// Starts from the doubling decision. With `pause_old_frontier`, a trial
/// generated under an earlier champion is paused once. A pause is then
/// lifted for the champion and for the top running challengers.
#[derive(Debug, Clone)]
pub struct ChaChaScheduler {
    doubling: SuccessiveDoublingScheduler,
    config: ChaChaConfig,
}

impl ChaChaScheduler {
    pub fn new(config: ChaChaConfig) -> Self {
        Self {
            doubling: SuccessiveDoublingScheduler::new(config.increase_factor),
            config,
        }
    }

    pub fn config(&self) -> &ChaChaConfig {
        &self.config
    }
}

impl Default for ChaChaScheduler {
    fn default() -> Self {
        Self::new(ChaChaConfig::default())
    }
}

impl TrialScheduler for ChaChaScheduler {
    fn on_trial_result(&self, pool: &mut TrialPool, idx: usize) -> Decision {
        let mut decision = self.doubling.on_trial_result(pool, idx);

        if self.config.pause_old_frontier
            && !pool.trial(idx).is_checked_under_current_champion()
            && decision == Decision::Continue
        {
            pool.trial_mut(idx).set_checked_under_current_champion(true);
            decision = Decision::Pause;
        }

        // The keep rules also override an old-frontier pause.
        if decision != Decision::Pause {
            return decision;
        }
        if self.config.keep_champion && pool.is_champion(idx) {
            return Decision::Continue;
        }
        if self.config.keep_challenger_ratio.is_some() {
            let top = pool.top_running_trials(
                self.config.keep_challenger_ratio,
                self.config.keep_challenger_metric,
            );
            if top.contains(&idx) {
                return Decision::Continue;
            }
        }
        decision
    }

    fn name(&self) -> &'static str {
        "chacha"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeepRatio, ScorePolicy, TrialArgs};
    use crate::result::OnlineResult;
    use crate::trial::tests::{factory, interaction_config};
    use crate::trial::Trial;

    fn add(pool: &mut TrialPool, term: &str, result: Option<OnlineResult>, lease: f64) -> usize {
        let mut trial = Trial::new(interaction_config(&[term]), TrialArgs::default(), factory()).unwrap();
        if let Some(result) = result {
            trial.force_result(result).unwrap();
        }
        trial.set_resource_lease(lease);
        trial.set_status(TrialStatus::Running);
        let idx = pool.insert(trial).unwrap();
        pool.mark_running(idx);
        idx
    }

    #[test]
    fn base_policy_always_continues() {
        let mut pool = TrialPool::new(100.0, 1);
        let idx = add(&mut pool, "ab", Some(OnlineResult::from_parts(0.3, 0.1, 1e6)), 10.0);
        assert_eq!(OnlineScheduler.on_trial_result(&mut pool, idx), Decision::Continue);
    }

    #[test]
    fn doubling_pauses_and_doubles_spent_lease() {
        let mut pool = TrialPool::new(100.0, 1);
        let idx = add(&mut pool, "ab", Some(OnlineResult::from_parts(0.3, 0.1, 100.0)), 100.0);
        let scheduler = SuccessiveDoublingScheduler::default();
        assert_eq!(scheduler.on_trial_result(&mut pool, idx), Decision::Pause);
        assert_eq!(pool.trial(idx).resource_lease(), 200.0);
    }

    #[test]
    fn doubling_continues_within_lease() {
        let mut pool = TrialPool::new(100.0, 1);
        let scheduler = SuccessiveDoublingScheduler::default();
        let within = add(&mut pool, "ab", Some(OnlineResult::from_parts(0.3, 0.1, 99.0)), 100.0);
        let fresh = add(&mut pool, "ac", None, 100.0);
        assert_eq!(scheduler.on_trial_result(&mut pool, within), Decision::Continue);
        assert_eq!(scheduler.on_trial_result(&mut pool, fresh), Decision::Continue);
        assert_eq!(pool.trial(within).resource_lease(), 100.0);
    }

    #[test]
    fn chacha_never_pauses_the_champion() {
        let mut pool = TrialPool::new(100.0, 1);
        let champion = add(&mut pool, "ab", Some(OnlineResult::from_parts(0.9, 0.1, 500.0)), 100.0);
        pool.set_champion(champion);
        let scheduler = ChaChaScheduler::new(
            ChaChaConfig::default().with_keep_challenger(None, ScorePolicy::Ucb),
        );
        assert_eq!(scheduler.on_trial_result(&mut pool, champion), Decision::Continue);
        // the lease still doubled
        assert_eq!(pool.trial(champion).resource_lease(), 200.0);
    }

    #[test]
    fn chacha_keeps_top_challengers() {
        let mut pool = TrialPool::new(100.0, 1);
        let champion = add(&mut pool, "ab", Some(OnlineResult::from_parts(0.5, 0.1, 150.0)), 1000.0);
        pool.set_champion(champion);
        let good = add(&mut pool, "ac", Some(OnlineResult::from_parts(0.1, 0.05, 150.0)), 100.0);
        let bad = add(&mut pool, "bc", Some(OnlineResult::from_parts(0.8, 0.05, 150.0)), 100.0);
        let scheduler = ChaChaScheduler::new(
            ChaChaConfig::default().with_keep_challenger(Some(KeepRatio::Best), ScorePolicy::Ucb),
        );
        assert_eq!(scheduler.on_trial_result(&mut pool, good), Decision::Continue);
        assert_eq!(scheduler.on_trial_result(&mut pool, bad), Decision::Pause);
    }

    #[test]
    fn chacha_pauses_old_frontier_once() {
        let mut pool = TrialPool::new(100.0, 1);
        let idx = add(&mut pool, "ab", Some(OnlineResult::from_parts(0.5, 0.1, 10.0)), 100.0);
        pool.trial_mut(idx).set_checked_under_current_champion(false);
        let scheduler = ChaChaScheduler::new(ChaChaConfig::default().with_pause_old_frontier(true));
        assert_eq!(scheduler.on_trial_result(&mut pool, idx), Decision::Pause);
        assert!(pool.trial(idx).is_checked_under_current_champion());
        assert_eq!(scheduler.on_trial_result(&mut pool, idx), Decision::Continue);
    }

    #[test]
    fn chacha_keeps_top_challenger_from_old_frontier() {
        let mut pool = TrialPool::new(100.0, 1);
        let champion = add(&mut pool, "ab", Some(OnlineResult::from_parts(0.5, 0.1, 150.0)), 1000.0);
        pool.set_champion(champion);
        // lease spent, ranked best, generated under an earlier champion
        let old = add(&mut pool, "ac", Some(OnlineResult::from_parts(0.1, 0.05, 150.0)), 100.0);
        pool.trial_mut(old).set_checked_under_current_champion(false);
        let scheduler = ChaChaScheduler::new(
            ChaChaConfig::default()
                .with_pause_old_frontier(true)
                .with_keep_challenger(Some(KeepRatio::Best), ScorePolicy::Ucb),
        );
        assert_eq!(scheduler.on_trial_result(&mut pool, old), Decision::Continue);
        assert_eq!(pool.trial(old).resource_lease(), 200.0);
        assert!(!pool.trial(old).is_checked_under_current_champion());
    }

    #[test]
    fn choose_prefers_pending_then_smallest_lease() {
        let mut pool = TrialPool::new(100.0, 1);
        let a = add(&mut pool, "ab", None, 400.0);
        let b = add(&mut pool, "ac", None, 200.0);
        let c = add(&mut pool, "bc", None, 200.0);
        for idx in [a, b, c] {
            pool.trial_mut(idx).set_status(TrialStatus::Paused);
            pool.mark_stopped(idx);
        }
        let scheduler = OnlineScheduler;
        // smallest lease, earliest on ties
        assert_eq!(scheduler.choose_trial_to_run(&pool), Some(b));

        let pending = Trial::new(interaction_config(&["ad"]), TrialArgs::default(), factory()).unwrap();
        let pending = pool.insert(pending).unwrap();
        assert_eq!(scheduler.choose_trial_to_run(&pool), Some(pending));
    }

    #[test]
    fn nothing_to_choose_from_running_only() {
        let mut pool = TrialPool::new(100.0, 1);
        add(&mut pool, "ab", None, 100.0);
        assert_eq!(ChaChaScheduler::default().choose_trial_to_run(&pool), None);
    }
}
