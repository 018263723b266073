//! Comparison of live kernel and switch state against a recorded attachment.

use anyhow::{Context, Result};
use std::net::IpAddr;

use super::provision::parse_ip;
use crate::config::{CachedNetConf, NetConf};
use crate::error::OvsCniError;
use crate::integrations::netlink::LinkOps;
use crate::integrations::ovsdb::SwitchDb;
use crate::mac::same_mac;
use crate::types::{IPConfig, Interface, Route};
use crate::vlan::VlanPolicy;

fn mismatch(field: &'static str, cached: &str, current: &str) -> Result<(), OvsCniError> {
    if cached == current {
        return Ok(());
    }
    Err(OvsCniError::CacheMismatch {
        field,
        cached: cached.to_string(),
        current: current.to_string(),
    })
}

/// The fields a later invocation relies on must not have drifted.
pub fn validate_cache(cache: &CachedNetConf, conf: &NetConf) -> Result<(), OvsCniError> {
    mismatch("BrName", &cache.netconf.br_name, &conf.br_name)?;
    mismatch("SocketFile", &cache.netconf.socket_file, &conf.socket_file)?;
    mismatch("IPAM", cache.netconf.ipam_type(), conf.ipam_type())?;
    mismatch("DeviceID", &cache.netconf.device_id, &conf.device_id)?;
    Ok(())
}

/// Check one reported interface against the live link.
///
/// `netns` is where the link lives; `None` for the host side.
pub fn validate_interface(
    links: &dyn LinkOps,
    netns: Option<&str>,
    intf: &Interface,
    is_host: bool,
    hw_offload: bool,
) -> Result<()> {
    let side = if is_host { "Host" } else { "Container" };
    if intf.name.is_empty() {
        return Err(OvsCniError::Verification(format!(
            "{} interface name missing in prevResult",
            side
        ))
        .into());
    }

    let link = links.link(netns, &intf.name).map_err(|_| {
        OvsCniError::Verification(format!(
            "Error: {} Interface name in prevResult: {} not found",
            side, intf.name
        ))
    })?;

    if !is_host && intf.sandbox_path().is_empty() {
        return Err(OvsCniError::Verification(format!(
            "Error: {} interface {} should not be in host namespace",
            side, link.name
        ))
        .into());
    }
    if is_host && !intf.sandbox_path().is_empty() {
        return Err(OvsCniError::Verification(format!(
            "Error: {} interface {} should be in host namespace",
            side, link.name
        ))
        .into());
    }
    if !hw_offload && link.kind.as_deref() != Some("veth") {
        return Err(OvsCniError::Verification(format!(
            "Error: {} interface {} not of type veth/p2p",
            side, link.name
        ))
        .into());
    }
    if let Some(mac) = intf.mac.as_deref().filter(|m| !m.is_empty()) {
        if !same_mac(mac, &link.mac) {
            return Err(OvsCniError::Verification(format!(
                "Error: Interface {} Mac {} doesn't match {} Mac: {}",
                intf.name, mac, side, link.mac
            ))
            .into());
        }
    }
    Ok(())
}

/// Every expected address must be present on `ifname`.
pub fn validate_ips(links: &dyn LinkOps, netns: &str, ifname: &str, ips: &[IPConfig]) -> Result<()> {
    let live = links.addresses(Some(netns), ifname)?;
    for ip in ips {
        let expected = parse_ip(&ip.address)?;
        if !live.contains(&expected) {
            return Err(OvsCniError::Verification(format!(
                "interface {} does not have expected address {}",
                ifname, expected
            ))
            .into());
        }
    }
    Ok(())
}

/// Every expected route must be in the namespace's routing table.
pub fn validate_routes(links: &dyn LinkOps, netns: &str, routes: &[Route]) -> Result<()> {
    if routes.is_empty() {
        return Ok(());
    }
    let live = links.routes(Some(netns))?;
    for route in routes {
        let dst = parse_ip(&route.dst)?;
        let gw = route
            .gw
            .as_deref()
            .map(|gw| gw.parse::<IpAddr>().with_context(|| format!("invalid route gateway {:?}", gw)))
            .transpose()?;
        let found = live
            .iter()
            .any(|r| r.dst == dst && (gw.is_none() || r.gateway == gw));
        if !found {
            return Err(OvsCniError::Verification(format!(
                "Route to {} via {} not found",
                route.dst,
                route.gw.as_deref().unwrap_or("<none>")
            ))
            .into());
        }
    }
    Ok(())
}

/// Bridge presence, error-free interfaces and the port's VLAN columns.
pub fn validate_switch(
    switch: &dyn SwitchDb,
    bridge: &str,
    policy: &VlanPolicy,
    host_ifname: &str,
) -> Result<()> {
    if !switch.bridge_exists(bridge)? {
        return Err(OvsCniError::Verification(format!(
            "Error: bridge {} is not found in OVS",
            bridge
        ))
        .into());
    }

    let errored = switch.interfaces_in_error()?;
    if !errored.is_empty() {
        return Err(OvsCniError::Verification(format!(
            "Error: There are some interfaces in error state: {:?}",
            errored
        ))
        .into());
    }

    let live = switch
        .port_vlan_state(host_ifname)
        .with_context(|| format!("Error: Failed to retrieve port {} state", host_ifname))?;

    match (policy.tag(), live.tag) {
        (None, Some(tag)) => {
            return Err(vlan_mismatch(format!("vlan tag mismatch. ovs={},netconf=nil", tag)));
        }
        (Some(expected), None) => {
            return Err(vlan_mismatch(format!("vlan tag mismatch. ovs=nil,netconf={}", expected)));
        }
        (Some(expected), Some(tag)) => {
            if tag != expected {
                return Err(vlan_mismatch(format!(
                    "vlan tag mismatch. ovs={},netconf={}",
                    tag, expected
                )));
            }
            if live.mode != "access" {
                return Err(vlan_mismatch(format!(
                    "vlan mode mismatch. expected=access,real={}",
                    live.mode
                )));
            }
        }
        (None, None) => {}
    }

    let expected = policy.trunks();
    if live.trunks != expected {
        return Err(vlan_mismatch(format!(
            "trunk mismatch. ovs={:?},netconf={:?}",
            live.trunks, expected
        )));
    }
    if !expected.is_empty() && live.mode != "trunk" {
        return Err(vlan_mismatch(format!(
            "vlan mode mismatch. expected=trunk,real={}",
            live.mode
        )));
    }
    Ok(())
}

fn vlan_mismatch(msg: String) -> anyhow::Error {
    OvsCniError::VlanMismatch(msg).into()
}
