//! Deployer Host Agent Library
//!
//! Keeps a server's managed system accounts' SSH authorization in step
//! with the Deployer directory service, and reports host metrics.

pub mod agents;
pub mod config;

pub use agents::{KeySyncAgent, MonitorAgent};
pub use config::{AgentConfig, ConfigStore};
