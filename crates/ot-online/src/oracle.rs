//! Challenger generation around the current champion.

use ot_learner::LearnerFactory;
use ot_search::{LocalSearchFactory, LocalSearcher, ParameterKind, SearchProperties, SearchSpace};
use ot_types::{config_error, config_signature, Config, ParameterValue, Signature, TuneResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{OracleConfig, TrialArgs};
use crate::interactions::{expansion_candidates, generate_all_comb};
use crate::result::OnlineResult;
use crate::trial::Trial;

/// Produces challenger trials from the champion's configuration.
///
/// Interaction-set hyperparameters grow by polynomial expansion; numeric and
/// categorical hyperparameters are proposed by one local searcher per
/// champion. Each
/// challenger changes one of the two groups relative to its seed, and no
/// signature is ever emitted twice.
pub struct ChampionFrontierSearcher {
    space: SearchSpace,
    config: OracleConfig,
    trial_args: TrialArgs,
    learner_factory: Arc<dyn LearnerFactory>,
    search_factory: Arc<dyn LocalSearchFactory>,
    rng: StdRng,
    challengers: Vec<Trial>,
    searcher_ids: HashMap<Signature, String>,
    signatures: HashMap<String, Signature>,
    local_searchers: HashMap<String, Box<dyn LocalSearcher>>,
    emitted: HashSet<Signature>,
    last_reported: HashMap<Signature, f64>,
}

impl ChampionFrontierSearcher {
    /// Build the oracle and its first challenger batch.
    ///
    /// The batch is generated around `init_config`, whose own trial is placed
    /// on top of the pool so it is the first one handed out.
    pub fn new(
        space: SearchSpace,
        init_config: &Config,
        config: OracleConfig,
        trial_args: TrialArgs,
        learner_factory: Arc<dyn LearnerFactory>,
        search_factory: Arc<dyn LocalSearchFactory>,
    ) -> TuneResult<Self> {
        config.validate()?;
        space.validate()?;
        if let Some(param) = space
            .parameters
            .iter()
            .find(|p| matches!(p.kind, ParameterKind::AutoInteractions))
        {
            return Err(config_error!(
                "interaction parameter '{}' must be resolved before challenger generation",
                param.name
            ));
        }

        let mut oracle = Self {
            rng: StdRng::seed_from_u64(config.seed),
            space,
            config,
            trial_args,
            learner_factory,
            search_factory,
            challengers: Vec::new(),
            searcher_ids: HashMap::new(),
            signatures: HashMap::new(),
            local_searchers: HashMap::new(),
            emitted: HashSet::new(),
            last_reported: HashMap::new(),
        };

        let init_config = oracle.space.complete_config(init_config);
        let init_trial = Trial::new(
            init_config.clone(),
            oracle.trial_args.clone(),
            Arc::clone(&oracle.learner_factory),
        )?;
        oracle.emitted.insert(init_trial.id().to_string());
        oracle.register(init_trial.id(), None);

        let batch = oracle.generate(&init_config, init_trial.id())?;
        info!(
            init = init_trial.id(),
            challengers = batch.len(),
            "challenger oracle initialized"
        );
        oracle.challengers.extend(batch);
        oracle.challengers.push(init_trial);
        Ok(oracle)
    }

    /// Take the most recently generated challenger.
    pub fn next_trial(&mut self) -> Option<Trial> {
        self.challengers.pop()
    }

    /// Challengers generated but not yet handed out.
    pub fn pool_len(&self) -> usize {
        self.challengers.len()
    }

    /// Generate a fresh batch around a new champion. Returns the batch size.
    pub fn set_champion(&mut self, champion: &Trial) -> TuneResult<usize> {
        let batch = self.generate(champion.config(), champion.id())?;
        let generated = batch.len();
        info!(
            champion = champion.id(),
            challengers = generated,
            pool = self.challengers.len() + generated,
            "generated challengers for new champion"
        );
        self.challengers.extend(batch);
        Ok(generated)
    }

    /// Latest loss seen for a trial.
    pub fn on_trial_result(&mut self, signature: &str, result: &OnlineResult) {
        self.last_reported.insert(signature.to_string(), result.loss_avg());
    }

    /// Forget a terminated trial and any local searcher it seeded.
    pub fn on_trial_complete(&mut self, signature: &str) {
        self.last_reported.remove(signature);
        if let Some(searcher_id) = self.searcher_ids.get(signature) {
            if self.local_searchers.remove(searcher_id).is_some() {
                debug!(trial = signature, "dropped local searcher of terminated trial");
            }
        }
    }

    pub fn last_reported_loss(&self, signature: &str) -> Option<f64> {
        self.last_reported.get(signature).copied()
    }

    /// Opaque id under which the local searchers know this trial.
    pub fn searcher_trial_id(&self, signature: &str) -> Option<&str> {
        self.searcher_ids.get(signature).map(String::as_str)
    }

    pub fn signature_of(&self, searcher_trial_id: &str) -> Option<&str> {
        self.signatures.get(searcher_trial_id).map(String::as_str)
    }

    pub fn local_searcher_count(&self) -> usize {
        self.local_searchers.len()
    }

    /// Keep the first searcher id ever assigned to a signature.
    fn register(&mut self, signature: &str, searcher_id: Option<String>) -> String {
        if let Some(existing) = self.searcher_ids.get(signature) {
            return existing.clone();
        }
        let id = searcher_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.searcher_ids.insert(signature.to_string(), id.clone());
        self.signatures.insert(id.clone(), signature.to_string());
        id
    }

    fn generate(&mut self, seed_config: &Config, seed_signature: &str) -> TuneResult<Vec<Trial>> {
        let seed_searcher_id = self.register(seed_signature, None);

        let mut groups = self.local_groups(seed_config, &seed_searcher_id)?;
        groups.extend(self.interaction_groups(seed_config));

        let mut trials = Vec::new();
        for (partial, searcher_id) in groups {
            let mut config = seed_config.clone();
            config.extend(partial);
            let signature = config_signature(&config);
            if !self.emitted.insert(signature.clone()) {
                continue;
            }
            let trial = Trial::new(config, self.trial_args.clone(), Arc::clone(&self.learner_factory))?;
            self.register(&signature, searcher_id);
            trials.push(trial);
        }
        Ok(trials)
    }

    /// Numeric and categorical sub-configs proposed around the seed, each with
    /// the searcher id it was suggested under.
    fn local_groups(
        &mut self,
        seed_config: &Config,
        seed_searcher_id: &str,
    ) -> TuneResult<Vec<(Config, Option<String>)>> {
        let local_space = self.space.local_subspace();
        if local_space.is_empty() {
            return Ok(Vec::new());
        }

        let searcher = match self.local_searchers.entry(seed_searcher_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let point: Config = seed_config
                    .iter()
                    .filter(|(name, _)| local_space.get(name).is_some())
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                let mut searcher = self.search_factory.create(
                    &local_space,
                    vec![point],
                    &self.config.pseudo_metric,
                    self.config.seed,
                )?;
                searcher.set_search_properties(&SearchProperties {
                    metric: None,
                    metric_target: Some(self.config.pseudo_large_loss),
                });
                searcher.suggest(seed_searcher_id);
                entry.insert(searcher)
            }
        };

        // No real loss flows back to the local searcher, so the seed point is
        // reported with a decaying pseudo-loss to move its incumbent forward.
        let pseudo_loss = searcher
            .metric_target()
            .map_or(self.config.pseudo_large_loss, |target| {
                target * self.config.pseudo_loss_decay
            });
        let report = HashMap::from([(self.config.pseudo_metric.clone(), pseudo_loss)]);
        searcher.on_trial_complete(seed_searcher_id, Some(&report), false);

        let mut groups = Vec::with_capacity(self.config.numerical_num);
        for _ in 0..self.config.numerical_num {
            let id = Uuid::new_v4().to_string();
            match searcher.suggest(&id) {
                Some(config) => groups.push((config, Some(id))),
                None => {
                    warn!(searcher = searcher.name(), "local searcher has no more suggestions");
                    break;
                }
            }
        }
        Ok(groups)
    }

    /// Interaction-set candidates for every polynomial-expansion parameter.
    fn interaction_groups(&mut self, seed_config: &Config) -> Vec<(Config, Option<String>)> {
        let mut groups = Vec::new();
        for param in &self.space.parameters {
            let ParameterKind::PolynomialExpansion {
                init_monomials,
                highest_poly_order,
                allow_self_inter,
            } = &param.kind
            else {
                continue;
            };

            let mut seed: BTreeSet<String> = seed_config
                .get(&param.name)
                .and_then(ParameterValue::as_interactions)
                .cloned()
                .unwrap_or_default();
            seed.extend(init_monomials.iter().cloned());
            let seed_terms: Vec<String> = seed.iter().cloned().collect();

            let all = generate_all_comb(
                &seed_terms,
                self.config.expansion_order,
                *allow_self_inter,
                *highest_poly_order,
            );
            for candidate in expansion_candidates(&seed, &all, self.config.addition_num, &mut self.rng) {
                let partial = Config::from([(param.name.clone(), ParameterValue::Interactions(candidate))]);
                groups.push((partial, None));
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::tests::factory;
    use ot_learner::INTERACTIONS_KEY;
    use ot_search::PerturbationSearchFactory;
    use ot_types::TuneError;

    fn poly_space(monomials: &[&str]) -> SearchSpace {
        SearchSpace::new().add_polynomial_expansion(INTERACTIONS_KEY, monomials.iter().copied(), None, false)
    }

    fn oracle(space: SearchSpace, init: &Config, seed: u64) -> ChampionFrontierSearcher {
        ChampionFrontierSearcher::new(
            space,
            init,
            OracleConfig::default().with_seed(seed),
            TrialArgs::default(),
            factory(),
            Arc::new(PerturbationSearchFactory::default()),
        )
        .unwrap()
    }

    fn drain(oracle: &mut ChampionFrontierSearcher) -> Vec<Trial> {
        std::iter::from_fn(|| oracle.next_trial()).collect()
    }

    #[test]
    fn init_trial_is_handed_out_first() {
        let mut oracle = oracle(poly_space(&["a", "b", "c"]), &Config::new(), 1);
        assert_eq!(oracle.pool_len(), 4);
        let first = oracle.next_trial().unwrap();
        assert_eq!(first.id(), r#"interactions=[]"#);

        let rest: BTreeSet<String> = drain(&mut oracle).iter().map(|t| t.id().to_string()).collect();
        let expected: BTreeSet<String> = [
            r#"interactions=["ab"]"#,
            r#"interactions=["ac"]"#,
            r#"interactions=["bc"]"#,
        ]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(rest, expected);
    }

    #[test]
    fn same_seed_same_challenger_order() {
        let space = poly_space(&["a", "b", "c", "d", "e"]);
        let ids = |seed| {
            let mut oracle = oracle(space.clone(), &Config::new(), seed);
            assert!(oracle.next_trial().is_some());
            let mut first: Vec<String> = drain(&mut oracle).iter().map(|t| t.id().to_string()).collect();

            // a second champion round from a challenger config
            let mut config = Config::new();
            config.insert(INTERACTIONS_KEY.into(), ParameterValue::interactions(["ab"]));
            let next = Trial::new(config, TrialArgs::default(), factory()).unwrap();
            oracle.set_champion(&next).unwrap();
            first.extend(drain(&mut oracle).iter().map(|t| t.id().to_string()));
            first
        };
        assert_eq!(ids(5), ids(5));
    }

    #[test]
    fn signatures_are_never_emitted_twice() {
        let mut oracle = oracle(poly_space(&["a", "b", "c"]), &Config::new(), 1);
        let init = oracle.next_trial().unwrap();
        let mut seen: HashSet<String> = drain(&mut oracle).iter().map(|t| t.id().to_string()).collect();
        seen.insert(init.id().to_string());

        assert_eq!(oracle.set_champion(&init).unwrap(), 0);

        let mut config = Config::new();
        config.insert(INTERACTIONS_KEY.into(), ParameterValue::interactions(["ab"]));
        let champion = Trial::new(config, TrialArgs::default(), factory()).unwrap();
        oracle.set_champion(&champion).unwrap();
        for trial in drain(&mut oracle) {
            assert!(seen.insert(trial.id().to_string()), "duplicate {}", trial.id());
        }
    }

    #[test]
    fn numeric_parameters_go_through_the_local_searcher() {
        let space = poly_space(&["a", "b"]).add_float("learning_rate", 0.01, 1.0);
        let mut init = Config::new();
        init.insert("learning_rate".into(), ParameterValue::Float(0.5));
        let mut oracle = oracle(space, &init, 3);
        assert_eq!(oracle.local_searcher_count(), 1);

        let init_trial = oracle.next_trial().unwrap();
        let challengers = drain(&mut oracle);
        let numeric: Vec<&Trial> = challengers
            .iter()
            .filter(|t| t.config()["learning_rate"] != ParameterValue::Float(0.5))
            .collect();
        assert_eq!(numeric.len(), OracleConfig::default().numerical_num);
        for trial in &numeric {
            // numeric challengers keep the seed's interactions
            assert_eq!(trial.config()[INTERACTIONS_KEY], init_trial.config()[INTERACTIONS_KEY]);
            let id = oracle.searcher_trial_id(trial.id()).unwrap();
            assert_eq!(oracle.signature_of(id), Some(trial.id()));
        }
        // poly challenger {"ab"} keeps the seed learning rate
        assert!(challengers
            .iter()
            .any(|t| t.config()["learning_rate"] == ParameterValue::Float(0.5)));
    }

    #[test]
    fn categorical_parameters_vary_across_challengers() {
        let space = poly_space(&["a", "b", "c"]).add_choice(
            "loss_function",
            vec![serde_json::json!("squared"), serde_json::json!("huber")],
        );
        let mut oracle = oracle(space, &Config::new(), 2);
        let init = oracle.next_trial().unwrap();
        assert_eq!(
            init.config()["loss_function"],
            ParameterValue::Json(serde_json::json!("squared"))
        );

        let challengers = drain(&mut oracle);
        let losses: BTreeSet<String> = challengers
            .iter()
            .map(|t| t.config()["loss_function"].to_string())
            .collect();
        assert_eq!(losses.len(), 2, "loss_function values: {losses:?}");
        // interaction challengers keep the seed choice
        assert!(challengers.iter().any(|t| {
            t.config()["loss_function"] == init.config()["loss_function"]
                && t.config()[INTERACTIONS_KEY] != init.config()[INTERACTIONS_KEY]
        }));
    }

    #[test]
    fn terminated_champion_drops_its_searcher() {
        let space = poly_space(&["a", "b"]).add_float("learning_rate", 0.01, 1.0);
        let mut oracle = oracle(space, &Config::new(), 3);
        let init = oracle.next_trial().unwrap();
        assert_eq!(oracle.local_searcher_count(), 1);
        oracle.on_trial_complete(init.id());
        assert_eq!(oracle.local_searcher_count(), 0);
    }

    #[test]
    fn unresolved_auto_interactions_are_rejected() {
        let result = ChampionFrontierSearcher::new(
            SearchSpace::new().add_auto_interactions(INTERACTIONS_KEY),
            &Config::new(),
            OracleConfig::default(),
            TrialArgs::default(),
            factory(),
            Arc::new(PerturbationSearchFactory::default()),
        );
        assert!(matches!(result, Err(TuneError::Config(_))));
    }
}
