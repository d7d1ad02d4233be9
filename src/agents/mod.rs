//! Agent modules for the Deployer host agent
//!
//! - `keys`: authorized_keys synchronization for managed system accounts
//! - `monitor`: one-shot host metrics reporting

pub mod keys;
pub mod monitor;

pub use keys::KeySyncAgent;
pub use monitor::MonitorAgent;
