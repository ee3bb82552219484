//! Error type for the NPM controller binary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("rule-set engine error: {0}")]
    Ruleset(#[from] ruleset::RulesetError),

    #[error("missing required environment variable {0}")]
    MissingEnv(String),

    #[error("policy {0} has no cached translation to tear down")]
    UntrackedPolicy(String),
}
