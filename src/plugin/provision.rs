use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::info;
use uuid::Uuid;

use crate::integrations::netlink::LinkOps;
use crate::types::{Interface, Result as CniResult};

/// Random host-side veth name, `veth` plus 8 hex digits.
pub fn host_veth_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("veth{}", &id[..8])
}

/// Create a veth pair with `ifname` inside `netns`.
///
/// Returns the host and container descriptors. The host MAC is read after
/// creation since the namespace move may change it.
pub fn setup_veth(
    links: &dyn LinkOps,
    netns: &str,
    ifname: &str,
    mtu: Option<u32>,
    mac: Option<&str>,
) -> Result<(Interface, Interface)> {
    let host_name = host_veth_name();
    links
        .add_veth(netns, ifname, &host_name, mtu, mac)
        .with_context(|| format!("failed to create veth pair {} <-> {}", host_name, ifname))?;

    links.set_up(Some(netns), ifname)?;
    let container = links.link(Some(netns), ifname)?;
    let host = links.link(None, &host_name)?;
    info!(host = %host_name, container = %ifname, netns, "created veth pair");

    Ok((
        Interface::new(&host_name, Some(host.mac), None),
        Interface::new(ifname, Some(container.mac), Some(netns.to_string())),
    ))
}

pub(crate) fn parse_ip(address: &str) -> Result<IpNetwork> {
    if address.contains('/') {
        address
            .parse::<IpNetwork>()
            .with_context(|| format!("invalid address {:?}", address))
    } else {
        let ip: IpAddr = address
            .parse()
            .with_context(|| format!("invalid address {:?}", address))?;
        Ok(IpNetwork::from(ip))
    }
}

/// Apply the addresses and routes of `result` to `ifname` in `netns`.
///
/// Routes without a gateway use the gateway of the first address of the
/// same family, if any.
pub fn configure_iface(
    links: &dyn LinkOps,
    netns: &str,
    ifname: &str,
    result: &CniResult,
) -> Result<()> {
    links.set_up(Some(netns), ifname)?;

    let mut gateways: Vec<IpAddr> = Vec::new();
    for ip in result.ips() {
        let addr = parse_ip(&ip.address)?;
        links
            .add_address(Some(netns), ifname, &addr)
            .with_context(|| format!("failed to add IP addr {} to {:?}", addr, ifname))?;
        if let Some(gw) = &ip.gateway {
            gateways.push(gw.parse::<IpAddr>().with_context(|| format!("invalid gateway {:?}", gw))?);
        }
    }

    for route in result.routes() {
        let dst = parse_ip(&route.dst)?;
        let gw = match &route.gw {
            Some(gw) => Some(gw.parse::<IpAddr>().with_context(|| format!("invalid route gateway {:?}", gw))?),
            None => gateways.iter().copied().find(|g| g.is_ipv4() == dst.is_ipv4()),
        };
        links
            .add_route(Some(netns), ifname, &dst, gw)
            .with_context(|| format!("failed to add route {}", dst))?;
    }
    Ok(())
}
