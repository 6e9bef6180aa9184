//! # ot-learner
//!
//! The online learner contract consumed by trials, and [`LinearLearner`], a
//! hashed linear regressor with namespace interactions.

mod learner;
mod linear;

pub use learner::{LearnerFactory, OnlineLearner};
pub use linear::{LinearLearner, LinearLearnerFactory, LinearSettings, INTERACTIONS_KEY};
