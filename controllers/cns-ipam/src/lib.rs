//! CNS IPAM pool controller: reconciles the per-node `NodeNetworkConfig`,
//! runs the pool monitor's grow/shrink loop, and serves the pod IPAM HTTP
//! surface.

pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod nmagent;
pub mod nnc;
pub mod pool;
pub mod retry;
pub mod started;
pub mod state;
pub mod watcher;

pub use config::Config;
pub use controller::Controller;
