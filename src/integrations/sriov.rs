//! SR-IOV virtual function handling through sysfs.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::netlink::{IpRoute2, LinkOps};
use crate::types::Interface;

const USERSPACE_DRIVERS: [&str; 3] = ["vfio-pci", "uio_pci_generic", "igb_uio"];
const HOST_NETNS: &str = "/proc/1/ns/net";

/// Hardware offload operations keyed by VF PCI address.
pub trait Offload {
    /// True when `device_id` names an SR-IOV virtual function.
    fn is_enabled(&self, device_id: &str) -> bool;

    /// True when the VF is bound to a driver without a kernel netdev.
    fn has_userspace_driver(&self, device_id: &str) -> Result<bool>;

    /// Uplink names that may be attached to the switch, in lookup order.
    fn uplink_candidates(&self, device_id: &str) -> Result<Vec<String>>;

    /// Current host netdev name of the VF.
    fn vf_link_name(&self, device_id: &str) -> Result<String>;

    /// Move the VF into `netns` as `ifname`; returns (host, container).
    #[allow(clippy::too_many_arguments)]
    fn setup_vf(
        &self,
        device_id: &str,
        netns: &str,
        ifname: &str,
        orig_name: &str,
        mtu: Option<u32>,
        mac: Option<&str>,
        userspace: bool,
    ) -> Result<(Interface, Interface)>;

    /// Switch-facing representor netdev of the VF.
    fn representor(&self, device_id: &str) -> Result<String>;

    /// Give the VF back to the host namespace under its original name.
    fn release_vf(&self, netns: &str, ifname: &str, orig_name: &str) -> Result<()>;

    /// Restore a VF that already sits in the host namespace.
    fn reset_vf(&self, device_id: &str, orig_name: &str) -> Result<()>;
}

/// [`Offload`] reading sysfs and driving links through `ip`.
#[derive(Debug, Clone)]
pub struct SysfsOffload {
    sysfs: PathBuf,
    links: IpRoute2,
}

impl Default for SysfsOffload {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsOffload {
    pub fn new(sysfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            links: IpRoute2::new(),
        }
    }

    fn device(&self, device_id: &str) -> PathBuf {
        self.sysfs.join("bus/pci/devices").join(device_id)
    }

    fn net_class(&self, name: &str) -> PathBuf {
        self.sysfs.join("class/net").join(name)
    }

    fn physfn(&self, device_id: &str) -> PathBuf {
        self.device(device_id).join("physfn")
    }

    /// Netdev names found under `<device>/net`.
    fn netdevs(dir: &Path) -> Result<Vec<String>> {
        let net = dir.join("net");
        let mut names = Vec::new();
        for entry in fs::read_dir(&net).with_context(|| format!("no netdev under {}", net.display()))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Index `N` of the `virtfnN` link of the PF that points at `device_id`.
    fn vf_index(&self, device_id: &str) -> Result<u32> {
        let physfn = self.physfn(device_id);
        for entry in fs::read_dir(&physfn)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name.strip_prefix("virtfn") else { continue };
            let target = fs::read_link(entry.path())?;
            if target.file_name().is_some_and(|f| f == device_id) {
                return index.parse().with_context(|| format!("bad VF link {}", name));
            }
        }
        bail!("VF {} not listed under its physical function", device_id)
    }

    fn read_attr(path: &Path) -> Option<String> {
        fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }
}

/// True when `port_name` is the representor name for VF `index`.
pub fn matches_representor(port_name: &str, index: u32) -> bool {
    let vf = format!("vf{}", index);
    if port_name == vf {
        return true;
    }
    port_name
        .strip_prefix("pf")
        .and_then(|rest| rest.split_once("vf"))
        .is_some_and(|(pf, idx)| pf.chars().all(|c| c.is_ascii_digit()) && !pf.is_empty() && idx == index.to_string())
}

impl Offload for SysfsOffload {
    fn is_enabled(&self, device_id: &str) -> bool {
        !device_id.is_empty() && self.physfn(device_id).exists()
    }

    fn has_userspace_driver(&self, device_id: &str) -> Result<bool> {
        let driver = fs::read_link(self.device(device_id).join("driver"))
            .with_context(|| format!("failed to read driver of {}", device_id))?;
        let name = driver
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(USERSPACE_DRIVERS.contains(&name.as_str()))
    }

    fn uplink_candidates(&self, device_id: &str) -> Result<Vec<String>> {
        let mut candidates = Vec::new();
        for pf in Self::netdevs(&self.physfn(device_id))? {
            if let Ok(master) = fs::read_link(self.net_class(&pf).join("master")) {
                if let Some(bond) = master.file_name() {
                    candidates.push(bond.to_string_lossy().into_owned());
                }
            }
            candidates.push(pf);
        }
        debug!(device_id, ?candidates, "uplink candidates");
        Ok(candidates)
    }

    fn vf_link_name(&self, device_id: &str) -> Result<String> {
        Self::netdevs(&self.device(device_id))?
            .into_iter()
            .next()
            .with_context(|| format!("VF {} has no netdev", device_id))
    }

    fn setup_vf(
        &self,
        device_id: &str,
        netns: &str,
        ifname: &str,
        orig_name: &str,
        mtu: Option<u32>,
        mac: Option<&str>,
        userspace: bool,
    ) -> Result<(Interface, Interface)> {
        let rep = self.representor(device_id)?;
        if let Some(mtu) = mtu.filter(|m| *m > 0) {
            self.links.set_mtu(None, &rep, mtu)?;
        }
        self.links.set_up(None, &rep)?;
        let rep_mac = self.links.link(None, &rep)?.mac;
        let host = Interface::new(&rep, Some(rep_mac), None);

        if userspace {
            return Ok((host, Interface::new(ifname, None, Some(netns.to_string()))));
        }

        self.links.move_to_netns(None, orig_name, netns)?;
        self.links.rename(Some(netns), orig_name, ifname)?;
        if let Some(mac) = mac {
            self.links.set_mac(Some(netns), ifname, mac)?;
        }
        if let Some(mtu) = mtu.filter(|m| *m > 0) {
            self.links.set_mtu(Some(netns), ifname, mtu)?;
        }
        self.links.set_up(Some(netns), ifname)?;
        let cont_mac = self.links.link(Some(netns), ifname)?.mac;
        info!(device_id, rep = %rep, ifname, "moved VF into container");

        Ok((host, Interface::new(ifname, Some(cont_mac), Some(netns.to_string()))))
    }

    fn representor(&self, device_id: &str) -> Result<String> {
        let index = self.vf_index(device_id)?;
        let pfs = Self::netdevs(&self.physfn(device_id))?;
        let pf = pfs.first().with_context(|| format!("no PF netdev for {}", device_id))?;
        let switch_id = Self::read_attr(&self.net_class(pf).join("phys_switch_id"))
            .filter(|s| !s.is_empty())
            .with_context(|| format!("PF {} is not in switchdev mode", pf))?;

        let class = self.sysfs.join("class/net");
        for entry in fs::read_dir(&class)? {
            let dir = entry?.path();
            if Self::read_attr(&dir.join("phys_switch_id")).as_deref() != Some(switch_id.as_str()) {
                continue;
            }
            let Some(port_name) = Self::read_attr(&dir.join("phys_port_name")) else { continue };
            if matches_representor(&port_name, index) {
                if let Some(name) = dir.file_name() {
                    return Ok(name.to_string_lossy().into_owned());
                }
            }
        }
        bail!("failed to find representor for VF {} (index {})", device_id, index)
    }

    fn release_vf(&self, netns: &str, ifname: &str, orig_name: &str) -> Result<()> {
        self.links.set_down(Some(netns), ifname)?;
        self.links.rename(Some(netns), ifname, orig_name)?;
        self.links.move_to_netns(Some(netns), orig_name, HOST_NETNS)?;
        info!(ifname, orig_name, "released VF to host namespace");
        Ok(())
    }

    fn reset_vf(&self, device_id: &str, orig_name: &str) -> Result<()> {
        let current = self.vf_link_name(device_id)?;
        if current != orig_name {
            self.links.set_down(None, &current)?;
            self.links.rename(None, &current, orig_name)?;
        }
        self.links.set_up(None, orig_name)?;
        Ok(())
    }
}
