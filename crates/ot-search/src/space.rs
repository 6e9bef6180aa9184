//! Search space definitions.

use ot_types::{Config, ParameterValue, SearchError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Hyperparameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is searched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (searched in log-space).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices, searched locally by index.
    Choice { values: Vec<serde_json::Value> },
    /// Set of feature-interaction terms grown by polynomial expansion of the
    /// champion's current terms together with `init_monomials`.
    PolynomialExpansion {
        init_monomials: BTreeSet<String>,
        highest_poly_order: Option<usize>,
        allow_self_inter: bool,
    },
    /// Polynomial expansion over the namespaces of the first observed sample.
    AutoInteractions,
}

impl ParameterKind {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::FloatRange { .. } | Self::IntRange { .. } | Self::LogUniform { .. }
        )
    }

    /// Whether the local searcher moves this dimension.
    pub fn is_locally_searched(&self) -> bool {
        self.is_numeric() || matches!(self, Self::Choice { .. })
    }

    pub fn is_interaction_set(&self) -> bool {
        matches!(self, Self::PolynomialExpansion { .. } | Self::AutoInteractions)
    }

    /// Value used to seed a configuration that does not name this parameter.
    pub fn seed_value(&self) -> Option<ParameterValue> {
        match self {
            Self::FloatRange { low, .. } | Self::LogUniform { low, .. } => {
                Some(ParameterValue::Float(*low))
            }
            Self::IntRange { low, .. } => Some(ParameterValue::Int(*low)),
            Self::Choice { values } => values.first().cloned().map(ParameterValue::Json),
            Self::PolynomialExpansion { .. } | Self::AutoInteractions => {
                Some(ParameterValue::Interactions(BTreeSet::new()))
            }
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(name, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.add(name, ParameterKind::Choice { values })
    }

    pub fn add_polynomial_expansion<I, S>(
        self,
        name: impl Into<String>,
        init_monomials: I,
        highest_poly_order: Option<usize>,
        allow_self_inter: bool,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add(
            name,
            ParameterKind::PolynomialExpansion {
                init_monomials: init_monomials.into_iter().map(Into::into).collect(),
                highest_poly_order,
                allow_self_inter,
            },
        )
    }

    pub fn add_auto_interactions(self, name: impl Into<String>) -> Self {
        self.add(name, ParameterKind::AutoInteractions)
    }

    fn add(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        let name = name.into();
        // Later definitions replace earlier ones with the same name.
        self.parameters.retain(|p| p.name != name);
        self.parameters.push(ParameterDef { name, kind });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ParameterDef> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    /// The numeric and categorical dimensions a local searcher can move.
    pub fn local_subspace(&self) -> SearchSpace {
        SearchSpace {
            parameters: self
                .parameters
                .iter()
                .filter(|p| p.kind.is_locally_searched())
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Check every domain is non-empty.
    pub fn validate(&self) -> Result<(), SearchError> {
        for param in &self.parameters {
            let empty = match &param.kind {
                ParameterKind::FloatRange { low, high } => !(low <= high),
                ParameterKind::LogUniform { low, high } => !(*low > 0.0 && low <= high),
                ParameterKind::IntRange { low, high } => low > high,
                ParameterKind::Choice { values } => values.is_empty(),
                ParameterKind::PolynomialExpansion { .. } | ParameterKind::AutoInteractions => {
                    false
                }
            };
            if empty {
                return Err(SearchError::EmptyDomain {
                    name: param.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Fill in every parameter missing from `config` with its seed value.
    pub fn complete_config(&self, config: &Config) -> Config {
        let mut completed = config.clone();
        for param in &self.parameters {
            if !completed.contains_key(&param.name) {
                if let Some(value) = param.kind.seed_value() {
                    completed.insert(param.name.clone(), value);
                }
            }
        }
        completed
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}
