//! Error types for the rule-set engine and policy translator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RulesetError {
    #[error("command {program} {args:?} failed: {stderr}")]
    Command {
        program: String,
        args: Vec<String>,
        stderr: String,
    },

    #[error("failed to acquire {path} after {attempts} attempts")]
    LockTimeout { path: String, attempts: u32 },

    #[error("set {0} does not exist")]
    UnknownSet(String),

    #[error("set {name} cannot reference set-list {member}: nested set-lists are not allowed")]
    NestedSetList { name: String, member: String },

    #[error("io error running external command: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RulesetError>;
