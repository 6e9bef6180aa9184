use ot_types::{Config, LearnerError, Sample};

/// An incrementally trained model.
///
/// Trials own one learner each and only ever talk to it through this trait.
pub trait OnlineLearner: Send {
    /// One step of learning on a labeled sample. Unlabeled samples are ignored.
    fn learn(&mut self, sample: &Sample);

    fn predict(&self, sample: &Sample) -> f64;

    /// Effective feature dimensionality of `sample` under this model's
    /// configuration (after interaction expansion).
    fn feature_dimension(&self, sample: &Sample) -> f64;
}

/// Builds learners from resolved configurations.
///
/// Construction must be deterministic: the same config always yields an
/// identically behaving learner.
pub trait LearnerFactory: Send + Sync {
    /// Check a configuration without building anything.
    fn validate(&self, config: &Config) -> Result<(), LearnerError>;

    fn build(&self, config: &Config) -> Result<Box<dyn OnlineLearner>, LearnerError>;
}
