//! ipset/iptables rule-set engine and `NetworkPolicy` translator.

pub mod engine;
pub mod error;
pub mod model;
pub mod runner;
pub mod translate;

pub use engine::RulesetEngine;
pub use error::{Result, RulesetError};
pub use translate::{translate, Translation};
