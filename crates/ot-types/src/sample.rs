//! Namespaced data samples, with a parser for the Vowpal Wabbit text format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::errors::SampleError;

/// Namespace used for features listed without a namespace name (`| x y`).
pub const DEFAULT_NAMESPACE: char = ' ';

/// A single named feature value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: f64,
}

/// One observation: an optional label plus features grouped by namespace.
///
/// Namespaces are identified by a single character, which is how interaction
/// terms such as `"ab"` refer to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub label: Option<f64>,
    pub namespaces: BTreeMap<char, Vec<Feature>>,
}

impl Sample {
    pub fn new(label: Option<f64>) -> Self {
        Self {
            label,
            namespaces: BTreeMap::new(),
        }
    }

    pub fn labeled(label: f64) -> Self {
        Self::new(Some(label))
    }

    pub fn with_feature(mut self, namespace: char, name: impl Into<String>, value: f64) -> Self {
        self.push_feature(namespace, name, value);
        self
    }

    pub fn push_feature(&mut self, namespace: char, name: impl Into<String>, value: f64) {
        self.namespaces.entry(namespace).or_default().push(Feature {
            name: name.into(),
            value,
        });
    }

    /// Number of features present in each namespace.
    pub fn namespace_dims(&self) -> BTreeMap<char, usize> {
        self.namespaces
            .iter()
            .map(|(ns, features)| (*ns, features.len()))
            .collect()
    }

    pub fn feature_count(&self) -> usize {
        self.namespaces.values().map(Vec::len).sum()
    }

    /// Parse one line in Vowpal Wabbit text format.
    ///
    /// `label [weight] [tag]|ns name[:value] ... |ns2 ...`. Feature values
    /// default to 1.0 and the namespace is the first character of its name.
    pub fn parse_vw(line: &str) -> Result<Self, SampleError> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return Err(SampleError::Empty);
        }

        let mut parts = line.split('|');
        let header = parts.next().unwrap_or_default();
        let label = match header.split_whitespace().next() {
            Some(token) => Some(token.parse::<f64>().map_err(|_| SampleError::InvalidLabel {
                label: token.to_string(),
            })?),
            None => None,
        };

        let mut sample = Sample::new(label);
        for group in parts {
            // A group starting with whitespace has no namespace name.
            let (namespace, body) = if group.starts_with(char::is_whitespace) || group.is_empty() {
                (DEFAULT_NAMESPACE, group)
            } else {
                let mut split = group.splitn(2, char::is_whitespace);
                let name = split.next().unwrap_or_default();
                let namespace = name.chars().next().unwrap_or(DEFAULT_NAMESPACE);
                (namespace, split.next().unwrap_or_default())
            };

            for token in body.split_whitespace() {
                let (name, value) = match token.split_once(':') {
                    Some((name, raw)) => {
                        let value = raw.parse::<f64>().map_err(|e| SampleError::InvalidFeature {
                            feature: token.to_string(),
                            message: e.to_string(),
                        })?;
                        (name, value)
                    }
                    None => (token, 1.0),
                };
                if name.is_empty() {
                    return Err(SampleError::InvalidFeature {
                        feature: token.to_string(),
                        message: "empty feature name".to_string(),
                    });
                }
                sample.push_feature(namespace, name, value);
            }
        }

        Ok(sample)
    }
}

impl FromStr for Sample {
    type Err = SampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_vw(s)
    }
}
