//! Hyperparameter values, resolved configurations and their signatures.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Canonical, order-independent identity of a configuration.
pub type Signature = String;

/// A resolved configuration: hyperparameter name → value.
///
/// Keys are kept sorted so iteration order is stable across runs.
pub type Config = BTreeMap<String, ParameterValue>;

/// A concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Float(f64),
    Int(i64),
    /// Set of active feature-interaction terms (e.g. `{"ab", "bc"}`).
    Interactions(BTreeSet<String>),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
            Self::Interactions(_) => None,
        }
    }

    pub fn as_interactions(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Interactions(terms) => Some(terms),
            _ => None,
        }
    }

    pub fn interactions<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Interactions(terms.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Debug keeps the decimal point, so `1.0` and `1` stay distinct.
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Interactions(terms) => {
                // Terms are quoted and escaped, so any namespace character is
                // safe. BTreeSet iterates in sorted order.
                let quoted: Vec<String> = terms.iter().map(|t| format!("{t:?}")).collect();
                write!(f, "[{}]", quoted.join(","))
            }
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Build the canonical signature of a configuration.
///
/// Keys are visited in sorted order and set-valued entries list their members
/// sorted, so two configurations that differ only in ordering collapse to the
/// same signature.
pub fn config_signature(config: &Config) -> Signature {
    config
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Canonical form of a single interaction term: its namespaces sorted.
pub fn canonical_term(term: &str) -> String {
    let mut chars: Vec<char> = term.chars().collect();
    chars.sort_unstable();
    chars.into_iter().collect()
}
