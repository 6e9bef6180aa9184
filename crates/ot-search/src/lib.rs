//! # ot-search
//!
//! Search space definitions and the local-search collaborator used to propose
//! numeric hyperparameter values near a seed configuration.
//!
//! The online engine addresses local searchers only through the
//! [`LocalSearcher`] / [`LocalSearchFactory`] traits; [`PerturbationSearch`]
//! is the bundled implementation.

mod local;
mod space;

pub use local::{
    LocalSearchFactory, LocalSearcher, PerturbationSearch, PerturbationSearchFactory,
    SearchProperties,
};
pub use space::{ParameterDef, ParameterKind, SearchSpace};
