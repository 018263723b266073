//! Capabilities the plugin drives: switch database, kernel links,
//! SR-IOV offload, IPAM delegation and the attachment cache.

pub mod cache;
pub mod garp;
pub mod ipam;
pub mod netlink;
pub mod netns;
pub mod ovsdb;
pub mod sriov;

use anyhow::Result;

use crate::config::PluginConfig;
use cache::{CacheStore, FileCache};
use ipam::{ExecIpam, Ipam};
use netlink::{IpRoute2, LinkOps};
use ovsdb::{OvsdbClient, SwitchDb};
use sriov::{Offload, SysfsOffload};

/// Everything outside the process one invocation talks to.
pub trait Host {
    /// Connect to the switch database at `socket_file`.
    fn switch(&self, socket_file: &str) -> Result<Box<dyn SwitchDb + '_>>;
    fn links(&self) -> &dyn LinkOps;
    fn offload(&self) -> &dyn Offload;
    fn ipam(&self) -> &dyn Ipam;
    fn cache(&self) -> &dyn CacheStore;
}

/// The real machine.
pub struct SystemHost {
    links: IpRoute2,
    offload: SysfsOffload,
    ipam: ExecIpam,
    cache: FileCache,
}

impl SystemHost {
    pub fn new(config: &PluginConfig) -> Self {
        Self {
            links: IpRoute2::new(),
            offload: SysfsOffload::default(),
            ipam: ExecIpam::new(),
            cache: FileCache::new(&config.cache_dir),
        }
    }
}

impl Host for SystemHost {
    fn switch(&self, socket_file: &str) -> Result<Box<dyn SwitchDb + '_>> {
        Ok(Box::new(OvsdbClient::new(socket_file)?))
    }

    fn links(&self) -> &dyn LinkOps {
        &self.links
    }

    fn offload(&self) -> &dyn Offload {
        &self.offload
    }

    fn ipam(&self) -> &dyn Ipam {
        &self.ipam
    }

    fn cache(&self) -> &dyn CacheStore {
        &self.cache
    }
}
