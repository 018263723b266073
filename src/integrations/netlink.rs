//! Kernel link, address and route operations.
//!
//! The [`LinkOps`] trait is the capability surface the plugin drives; the
//! [`IpRoute2`] implementation shells out to `ip` inside the target namespace.

use anyhow::{bail, Context, Result};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;
use tracing::debug;

use super::garp;
use super::netns::in_netns;
use crate::error::OvsCniError;
use crate::mac::parse_mac;

/// Live state of one kernel link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub mac: String,
    /// `info_kind`, e.g. "veth"; `None` for physical devices
    pub kind: Option<String>,
    pub oper_state: String,
}

/// One entry of a routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub dst: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub dev: Option<String>,
}

/// Namespace-aware link operations. `netns: None` means the host namespace.
pub trait LinkOps {
    fn namespace_exists(&self, netns: &str) -> bool;

    /// Create a veth pair whose `ifname` end is created directly in `netns`
    /// and whose `host_name` end stays in the host namespace.
    fn add_veth(
        &self,
        netns: &str,
        ifname: &str,
        host_name: &str,
        mtu: Option<u32>,
        mac: Option<&str>,
    ) -> Result<()>;

    /// Look up a link; fails with `LinkNotFound` when it does not exist.
    fn link(&self, netns: Option<&str>, name: &str) -> Result<LinkInfo>;

    fn set_up(&self, netns: Option<&str>, name: &str) -> Result<()>;

    fn set_mac(&self, netns: Option<&str>, name: &str, mac: &str) -> Result<()>;

    fn delete_link(&self, netns: Option<&str>, name: &str) -> Result<()>;

    fn add_address(&self, netns: Option<&str>, name: &str, addr: &IpNetwork) -> Result<()>;

    fn add_route(
        &self,
        netns: Option<&str>,
        name: &str,
        dst: &IpNetwork,
        gateway: Option<IpAddr>,
    ) -> Result<()>;

    fn addresses(&self, netns: Option<&str>, name: &str) -> Result<Vec<IpNetwork>>;

    fn routes(&self, netns: Option<&str>) -> Result<Vec<RouteEntry>>;

    /// Announce `ip` from `name` inside `netns`.
    fn send_gratuitous_arp(&self, netns: &str, name: &str, ip: Ipv4Addr) -> Result<()>;
}

/// `ip`-command backed implementation of [`LinkOps`].
#[derive(Debug, Clone, Default)]
pub struct IpRoute2;

#[derive(Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    operstate: String,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    local: IpAddr,
    prefixlen: u8,
}

#[derive(Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    dev: Option<String>,
}

/// Run `ip` in the current namespace, mapping unknown-device failures.
fn run_ip(dev: &str, args: &[&str]) -> Result<Vec<u8>> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip")
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute ip {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("Cannot find device") || stderr.contains("does not exist") {
            return Err(OvsCniError::LinkNotFound(dev.to_string()).into());
        }
        bail!("ip {} failed: {}", args.join(" "), stderr);
    }

    Ok(output.stdout)
}

fn parse_link(stdout: &[u8], name: &str) -> Result<LinkInfo> {
    let links: Vec<IpLink> =
        serde_json::from_slice(stdout).context("Failed to parse ip link output")?;
    let link = links
        .into_iter()
        .next()
        .ok_or_else(|| OvsCniError::LinkNotFound(name.to_string()))?;
    Ok(LinkInfo {
        name: link.ifname,
        mac: link.address,
        kind: link.linkinfo.and_then(|i| i.info_kind),
        oper_state: link.operstate,
    })
}

fn parse_routes(stdout: &[u8], default_dst: &str) -> Result<Vec<RouteEntry>> {
    let routes: Vec<IpRoute> =
        serde_json::from_slice(stdout).context("Failed to parse ip route output")?;
    routes
        .into_iter()
        .map(|r| -> Result<RouteEntry> {
            let dst = if r.dst == "default" { default_dst } else { r.dst.as_str() };
            let dst = if dst.contains('/') {
                dst.parse::<IpNetwork>().map_err(anyhow::Error::from)
            } else {
                dst.parse::<IpAddr>().map(IpNetwork::from).map_err(anyhow::Error::from)
            }
            .with_context(|| format!("invalid route destination {:?}", r.dst))?;
            Ok(RouteEntry { dst, gateway: r.gateway, dev: r.dev })
        })
        .collect()
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self
    }

    /// Run `ip` in `netns`, or in the host namespace when `None`.
    pub fn ip(&self, netns: Option<&str>, dev: &str, args: &[&str]) -> Result<Vec<u8>> {
        match netns {
            Some(path) => in_netns(path, || run_ip(dev, args)),
            None => run_ip(dev, args),
        }
    }

    pub fn set_down(&self, netns: Option<&str>, name: &str) -> Result<()> {
        self.ip(netns, name, &["link", "set", "dev", name, "down"])?;
        Ok(())
    }

    pub fn set_mtu(&self, netns: Option<&str>, name: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.ip(netns, name, &["link", "set", "dev", name, "mtu", &mtu])?;
        Ok(())
    }

    pub fn rename(&self, netns: Option<&str>, name: &str, new_name: &str) -> Result<()> {
        self.ip(netns, name, &["link", "set", "dev", name, "name", new_name])?;
        Ok(())
    }

    /// Move `name` from `netns` into the namespace file `target`.
    pub fn move_to_netns(&self, netns: Option<&str>, name: &str, target: &str) -> Result<()> {
        self.ip(netns, name, &["link", "set", "dev", name, "netns", target])?;
        Ok(())
    }
}

impl LinkOps for IpRoute2 {
    fn namespace_exists(&self, netns: &str) -> bool {
        super::netns::exists(netns)
    }

    fn add_veth(
        &self,
        netns: &str,
        ifname: &str,
        host_name: &str,
        mtu: Option<u32>,
        mac: Option<&str>,
    ) -> Result<()> {
        let mtu = mtu.filter(|m| *m > 0).map(|m| m.to_string());
        let mut args = vec!["link", "add", host_name];
        if let Some(mtu) = &mtu {
            args.extend(["mtu", mtu.as_str()]);
        }
        args.extend(["type", "veth", "peer", "name", ifname]);
        if let Some(mtu) = &mtu {
            args.extend(["mtu", mtu.as_str()]);
        }
        if let Some(mac) = mac {
            args.extend(["address", mac]);
        }
        args.extend(["netns", netns]);
        run_ip(host_name, &args)?;
        Ok(())
    }

    fn link(&self, netns: Option<&str>, name: &str) -> Result<LinkInfo> {
        let stdout = self.ip(netns, name, &["-j", "-d", "link", "show", "dev", name])?;
        parse_link(&stdout, name)
    }

    fn set_up(&self, netns: Option<&str>, name: &str) -> Result<()> {
        self.ip(netns, name, &["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn set_mac(&self, netns: Option<&str>, name: &str, mac: &str) -> Result<()> {
        self.ip(netns, name, &["link", "set", "dev", name, "address", mac])
            .with_context(|| format!("failed to set container iface {:?} MAC {:?}", name, mac))?;
        Ok(())
    }

    fn delete_link(&self, netns: Option<&str>, name: &str) -> Result<()> {
        self.ip(netns, name, &["link", "delete", "dev", name])?;
        Ok(())
    }

    fn add_address(&self, netns: Option<&str>, name: &str, addr: &IpNetwork) -> Result<()> {
        let addr = addr.to_string();
        self.ip(netns, name, &["addr", "add", &addr, "dev", name])?;
        Ok(())
    }

    fn add_route(
        &self,
        netns: Option<&str>,
        name: &str,
        dst: &IpNetwork,
        gateway: Option<IpAddr>,
    ) -> Result<()> {
        let dst = dst.to_string();
        let gw = gateway.map(|g| g.to_string());
        let mut args = vec!["route", "add", dst.as_str()];
        if let Some(gw) = &gw {
            args.extend(["via", gw.as_str()]);
        }
        args.extend(["dev", name]);
        self.ip(netns, name, &args)?;
        Ok(())
    }

    fn addresses(&self, netns: Option<&str>, name: &str) -> Result<Vec<IpNetwork>> {
        let stdout = self.ip(netns, name, &["-j", "addr", "show", "dev", name])?;
        let entries: Vec<IpAddrEntry> =
            serde_json::from_slice(&stdout).context("Failed to parse ip addr output")?;
        entries
            .into_iter()
            .flat_map(|e| e.addr_info)
            .map(|a| IpNetwork::new(a.local, a.prefixlen).map_err(anyhow::Error::from))
            .collect()
    }

    fn routes(&self, netns: Option<&str>) -> Result<Vec<RouteEntry>> {
        let v4 = self.ip(netns, "", &["-j", "-4", "route", "show"])?;
        let v6 = self.ip(netns, "", &["-j", "-6", "route", "show"])?;
        let mut routes = parse_routes(&v4, "0.0.0.0/0")?;
        routes.extend(parse_routes(&v6, "::/0")?);
        Ok(routes)
    }

    fn send_gratuitous_arp(&self, netns: &str, name: &str, ip: Ipv4Addr) -> Result<()> {
        in_netns(netns, || {
            let stdout = run_ip(name, &["-j", "link", "show", "dev", name])?;
            let link = parse_link(&stdout, name)?;
            garp::announce(name, ip, parse_mac(&link.mac)?)
        })
    }
}
