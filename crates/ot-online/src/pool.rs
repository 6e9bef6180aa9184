//! The trial set owned by the runner, as seen by schedulers.

use ot_types::Signature;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashMap};

use crate::config::{KeepRatio, ScorePolicy};
use crate::trial::{Trial, TrialStatus};

/// Every trial ever admitted, the running subset and the champion.
///
/// Trials are addressed by their position in admission order. Iteration over
/// the running subset follows that order, which keeps every step
/// deterministic for a given seed.
pub struct TrialPool {
    trials: Vec<Trial>,
    index: HashMap<Signature, usize>,
    running: BTreeSet<usize>,
    champion: Option<usize>,
    warmstart_num: f64,
    rng: StdRng,
}

impl TrialPool {
    pub fn new(warmstart_num: f64, seed: u64) -> Self {
        Self {
            trials: Vec::new(),
            index: HashMap::new(),
            running: BTreeSet::new(),
            champion: None,
            warmstart_num,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub(crate) fn trials_mut(&mut self) -> &mut [Trial] {
        &mut self.trials
    }

    pub fn trial(&self, idx: usize) -> &Trial {
        &self.trials[idx]
    }

    pub fn trial_mut(&mut self, idx: usize) -> &mut Trial {
        &mut self.trials[idx]
    }

    pub fn find(&self, signature: &str) -> Option<usize> {
        self.index.get(signature).copied()
    }

    /// Running trials in admission order.
    pub fn running(&self) -> impl Iterator<Item = usize> + '_ {
        self.running.iter().copied()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self, idx: usize) -> bool {
        self.running.contains(&idx)
    }

    pub fn champion(&self) -> Option<usize> {
        self.champion
    }

    pub fn is_champion(&self, idx: usize) -> bool {
        self.champion == Some(idx)
    }

    /// Resource a trial must consume before it is compared with others.
    pub fn warmstart_num(&self) -> f64 {
        self.warmstart_num
    }

    /// Trials that are neither terminated nor errored.
    pub fn active_count(&self) -> usize {
        self.trials.iter().filter(|t| !t.status().is_final()).count()
    }

    /// Add a trial unless one with the same signature exists; the existing
    /// index is returned as the error in that case.
    pub(crate) fn insert(&mut self, trial: Trial) -> Result<usize, usize> {
        if let Some(existing) = self.find(trial.id()) {
            return Err(existing);
        }
        let idx = self.trials.len();
        self.index.insert(trial.id().to_string(), idx);
        self.trials.push(trial);
        Ok(idx)
    }

    pub(crate) fn mark_running(&mut self, idx: usize) {
        self.running.insert(idx);
    }

    pub(crate) fn mark_stopped(&mut self, idx: usize) {
        self.running.remove(&idx);
    }

    pub(crate) fn set_champion(&mut self, idx: usize) -> Option<usize> {
        if let Some(previous) = self.champion {
            self.trials[previous].set_champion(false);
        }
        self.trials[idx].set_champion(true);
        self.champion.replace(idx)
    }

    pub(crate) fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// The best running trials by `metric`, among those past warm start.
    ///
    /// The count is taken relative to all running trials; ties are broken by
    /// a seeded shuffle before a stable sort.
    pub fn top_running_trials(&mut self, ratio: Option<KeepRatio>, metric: ScorePolicy) -> Vec<usize> {
        let top_number = ratio.map_or(0, |r| r.top_number(self.running.len()));
        if top_number == 0 {
            return Vec::new();
        }

        let warmstart = self.warmstart_num;
        let mut valid: Vec<usize> = self
            .running
            .iter()
            .copied()
            .filter(|&idx| {
                self.trials[idx]
                    .result()
                    .is_some_and(|r| r.resource_used() >= warmstart)
            })
            .collect();
        self.shuffle(&mut valid);

        let mut scored: Vec<(usize, f64)> = valid
            .into_iter()
            .filter_map(|idx| self.trials[idx].result().map(|r| (idx, r.score(metric))))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.into_iter().take(top_number).map(|(idx, _)| idx).collect()
    }

    /// Status counts for monitoring.
    pub fn status_counts(&self) -> HashMap<TrialStatus, usize> {
        let mut counts = HashMap::new();
        for trial in &self.trials {
            *counts.entry(trial.status()).or_insert(0) += 1;
        }
        counts
    }
}
