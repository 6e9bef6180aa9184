//! Hashed linear regression with namespace interactions, trained by
//! per-coordinate adaptive gradient descent.

use ot_types::{Config, Feature, LearnerError, ParameterValue, Sample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::learner::{LearnerFactory, OnlineLearner};

/// Config key holding the set of interaction terms.
pub const INTERACTIONS_KEY: &str = "interactions";

const LEARNING_RATE_KEY: &str = "learning_rate";
const L2_KEY: &str = "l2";
const NUM_BITS_KEY: &str = "num_bits";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Settings resolved from a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSettings {
    pub interactions: BTreeSet<String>,
    pub learning_rate: f64,
    pub l2: f64,
    pub num_bits: u32,
}

impl Default for LinearSettings {
    fn default() -> Self {
        Self {
            interactions: BTreeSet::new(),
            learning_rate: 0.5,
            l2: 0.0,
            num_bits: 18,
        }
    }
}

impl LinearSettings {
    /// Read the settings this learner understands; other keys are ignored.
    pub fn from_config(config: &Config) -> Result<Self, LearnerError> {
        let mut settings = Self::default();

        if let Some(value) = config.get(INTERACTIONS_KEY) {
            let terms = value.as_interactions().ok_or_else(|| LearnerError::InvalidConfig {
                parameter: INTERACTIONS_KEY.to_string(),
                message: format!("expected a set of interaction terms, got {value}"),
            })?;
            if let Some(term) = terms.iter().find(|t| t.is_empty()) {
                return Err(LearnerError::InvalidConfig {
                    parameter: INTERACTIONS_KEY.to_string(),
                    message: format!("empty interaction term '{term}'"),
                });
            }
            settings.interactions = terms.clone();
        }

        if let Some(lr) = numeric(config, LEARNING_RATE_KEY)? {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(invalid(LEARNING_RATE_KEY, format!("must be positive, got {lr}")));
            }
            settings.learning_rate = lr;
        }

        if let Some(l2) = numeric(config, L2_KEY)? {
            if !(l2.is_finite() && l2 >= 0.0) {
                return Err(invalid(L2_KEY, format!("must be non-negative, got {l2}")));
            }
            settings.l2 = l2;
        }

        if let Some(bits) = numeric(config, NUM_BITS_KEY)? {
            if !(1.0..=28.0).contains(&bits) || bits.fract() != 0.0 {
                return Err(invalid(NUM_BITS_KEY, format!("must be an integer in 1..=28, got {bits}")));
            }
            settings.num_bits = bits as u32;
        }

        Ok(settings)
    }
}

fn numeric(config: &Config, key: &str) -> Result<Option<f64>, LearnerError> {
    match config.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(key, format!("expected a number, got {value}"))),
    }
}

fn invalid(parameter: &str, message: String) -> LearnerError {
    LearnerError::InvalidConfig {
        parameter: parameter.to_string(),
        message,
    }
}

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(seed, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Linear model over hashed namespace features and their interactions.
#[derive(Debug, Clone)]
pub struct LinearLearner {
    settings: LinearSettings,
    mask: u64,
    weights: Vec<f64>,
    grad_squares: Vec<f64>,
    updates: u64,
}

impl LinearLearner {
    pub fn new(settings: LinearSettings) -> Self {
        let size = 1usize << settings.num_bits;
        Self {
            mask: (size as u64) - 1,
            weights: vec![0.0; size],
            grad_squares: vec![0.0; size],
            updates: 0,
            settings,
        }
    }

    pub fn settings(&self) -> &LinearSettings {
        &self.settings
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Hashed (index, value) pairs for every active feature, bias included.
    fn features(&self, sample: &Sample) -> Vec<(usize, f64)> {
        let mut out = vec![(self.index(fnv1a(FNV_OFFSET, b"constant")), 1.0)];

        for (ns, features) in &sample.namespaces {
            let ns_seed = fnv1a(FNV_OFFSET, ns.to_string().as_bytes());
            for feature in features {
                out.push((self.index(feature_hash(ns_seed, feature)), feature.value));
            }
        }

        for term in &self.settings.interactions {
            let mut partial: Vec<(u64, f64)> = vec![(FNV_OFFSET, 1.0)];
            for ns in term.chars() {
                let Some(features) = sample.namespaces.get(&ns) else {
                    partial.clear();
                    break;
                };
                let ns_seed = fnv1a(FNV_OFFSET, ns.to_string().as_bytes());
                partial = partial
                    .iter()
                    .flat_map(|(hash, value)| {
                        features.iter().map(move |f| {
                            let h = feature_hash(ns_seed, f);
                            (fnv1a(*hash, &h.to_le_bytes()), value * f.value)
                        })
                    })
                    .collect();
            }
            out.extend(partial.into_iter().map(|(h, v)| (self.index(h), v)));
        }

        out
    }

    fn index(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }
}

fn feature_hash(ns_seed: u64, feature: &Feature) -> u64 {
    fnv1a(ns_seed, feature.name.as_bytes())
}

impl OnlineLearner for LinearLearner {
    fn learn(&mut self, sample: &Sample) {
        let Some(label) = sample.label else {
            return;
        };
        let features = self.features(sample);
        let prediction: f64 = features.iter().map(|(i, v)| self.weights[*i] * v).sum();
        let error = prediction - label;

        for (i, v) in features {
            let grad = error * v + self.settings.l2 * self.weights[i];
            self.grad_squares[i] += grad * grad;
            if self.grad_squares[i] > 0.0 {
                self.weights[i] -= self.settings.learning_rate * grad / self.grad_squares[i].sqrt();
            }
        }
        self.updates += 1;
    }

    fn predict(&self, sample: &Sample) -> f64 {
        self.features(sample)
            .iter()
            .map(|(i, v)| self.weights[*i] * v)
            .sum()
    }

    fn feature_dimension(&self, sample: &Sample) -> f64 {
        let dims = sample.namespace_dims();
        let linear: f64 = dims.values().map(|d| *d as f64).sum();
        let interactions: f64 = self
            .settings
            .interactions
            .iter()
            .map(|term| {
                term.chars()
                    .map(|ns| dims.get(&ns).copied().unwrap_or(0) as f64)
                    .product::<f64>()
            })
            .sum();
        linear + interactions
    }
}

/// Builds [`LinearLearner`]s, applying `defaults` beneath each config.
#[derive(Debug, Clone, Default)]
pub struct LinearLearnerFactory {
    defaults: Config,
}

impl LinearLearnerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed settings shared by every learner (e.g. `num_bits`).
    pub fn with_default(mut self, key: impl Into<String>, value: ParameterValue) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    fn merged(&self, config: &Config) -> Config {
        let mut merged = self.defaults.clone();
        merged.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

impl LearnerFactory for LinearLearnerFactory {
    fn validate(&self, config: &Config) -> Result<(), LearnerError> {
        LinearSettings::from_config(&self.merged(config)).map(|_| ())
    }

    fn build(&self, config: &Config) -> Result<Box<dyn OnlineLearner>, LearnerError> {
        let settings = LinearSettings::from_config(&self.merged(config))?;
        debug!(
            interactions = settings.interactions.len(),
            learning_rate = settings.learning_rate,
            "building linear learner"
        );
        Ok(Box::new(LinearLearner::new(settings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(terms: &[&str], lr: f64) -> Config {
        let mut config = Config::new();
        config.insert(INTERACTIONS_KEY.into(), ParameterValue::interactions(terms.iter().copied()));
        config.insert(LEARNING_RATE_KEY.into(), ParameterValue::Float(lr));
        config
    }

    fn sample(label: f64, a: f64, b: f64) -> Sample {
        Sample::labeled(label)
            .with_feature('a', "x", a)
            .with_feature('b', "y", b)
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let settings = LinearSettings::from_config(&Config::new()).unwrap();
        assert_eq!(settings, LinearSettings::default());

        let settings = LinearSettings::from_config(&config_with(&["ab"], 0.1)).unwrap();
        assert!(settings.interactions.contains("ab"));
        assert!((settings.learning_rate - 0.1).abs() < 1e-12);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let factory = LinearLearnerFactory::new();
        assert!(factory.validate(&config_with(&[], -1.0)).is_err());

        let mut wrong_type = Config::new();
        wrong_type.insert(INTERACTIONS_KEY.into(), ParameterValue::Float(1.0));
        assert!(matches!(
            factory.validate(&wrong_type),
            Err(LearnerError::InvalidConfig { .. })
        ));

        let mut bits = Config::new();
        bits.insert(NUM_BITS_KEY.into(), ParameterValue::Int(40));
        assert!(factory.build(&bits).is_err());
    }

    #[test]
    fn feature_dimension_counts_interactions() {
        let learner = LinearLearner::new(LinearSettings::from_config(&config_with(&["ab", "ac"], 0.5)).unwrap());
        let s = Sample::labeled(1.0)
            .with_feature('a', "x1", 1.0)
            .with_feature('a', "x2", 1.0)
            .with_feature('b', "y1", 1.0)
            .with_feature('b', "y2", 1.0)
            .with_feature('b', "y3", 1.0);
        // 2 + 3 linear, 2*3 for "ab", 0 for "ac" (no namespace c)
        assert_eq!(learner.feature_dimension(&s), 11.0);
    }

    #[test]
    fn learns_a_linear_target() {
        let mut learner = LinearLearner::new(LinearSettings::from_config(&config_with(&[], 0.5)).unwrap());
        for i in 0..2000 {
            let a = (i % 7) as f64 / 7.0;
            let b = (i % 5) as f64 / 5.0;
            learner.learn(&sample(2.0 * a - b + 0.5, a, b));
        }
        let err = (learner.predict(&sample(0.0, 0.5, 0.4)) - (1.0 - 0.4 + 0.5)).abs();
        assert!(err < 0.2, "prediction error too large: {err}");
        assert_eq!(learner.updates(), 2000);
    }

    #[test]
    fn interactions_capture_products() {
        let target = |a: f64, b: f64| 3.0 * a * b;
        let train = |terms: &[&str]| {
            let mut learner = LinearLearner::new(LinearSettings::from_config(&config_with(terms, 0.5)).unwrap());
            for i in 0..3000 {
                let a = ((i * 3) % 11) as f64 / 10.0;
                let b = ((i * 7) % 13) as f64 / 12.0;
                learner.learn(&sample(target(a, b), a, b));
            }
            let mut loss = 0.0;
            for i in 0..50 {
                let a = (i % 10) as f64 / 10.0;
                let b = (i % 6) as f64 / 6.0;
                loss += (learner.predict(&sample(0.0, a, b)) - target(a, b)).abs();
            }
            loss / 50.0
        };
        assert!(train(&["ab"]) < train(&[]));
    }

    #[test]
    fn unlabeled_samples_are_not_learned() {
        let mut learner = LinearLearner::new(LinearSettings::default());
        learner.learn(&Sample::new(None).with_feature('a', "x", 1.0));
        assert_eq!(learner.updates(), 0);
    }

    #[test]
    fn construction_is_deterministic() {
        let factory = LinearLearnerFactory::new().with_default(NUM_BITS_KEY, ParameterValue::Int(12));
        let config = config_with(&["ab"], 0.3);
        let mut first = factory.build(&config).unwrap();
        let mut second = factory.build(&config).unwrap();
        for i in 0..50 {
            let s = sample(i as f64 * 0.1, (i % 3) as f64, (i % 4) as f64);
            first.learn(&s);
            second.learn(&s);
        }
        let query = sample(0.0, 1.0, 2.0);
        assert_eq!(first.predict(&query), second.predict(&query));
    }
}
