//! OVS CNI plugin
//!
//! Attaches containers to Open vSwitch bridges:
//! - veth pairs, or SR-IOV virtual functions with hardware offload
//! - access, trunk or unrestricted VLAN ports
//! - IPAM delegation with rollback when a later step fails
//! - a per-interface cache that keeps DEL and CHECK idempotent

pub mod commands;
pub mod config;
pub mod error;
pub mod integrations;
pub mod mac;
pub mod plugin;
pub mod types;
pub mod vlan;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, dispatch, run_cni};
pub use config::{CachedNetConf, NetConf, PluginConfig};
pub use error::OvsCniError;
pub use integrations::{Host, SystemHost};
pub use plugin::OvsPlugin;
pub use vlan::VlanPolicy;
