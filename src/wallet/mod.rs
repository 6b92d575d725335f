//! Hot wallet addresses: pool lifecycle and engine resource statistics

pub mod pool;
pub mod resources;

pub use pool::{PoolError, WalletAddressPool};
pub use resources::{ResourceMonitor, ResourceStats, collect_resource_stats};
