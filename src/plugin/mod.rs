//! Attach, detach and verify for one container interface.

pub mod bridge;
pub mod provision;
pub mod rollback;
pub mod sweep;
pub mod verify;

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{cache_ref, CachedNetConf, NetConf};
use crate::error::{best_effort, OvsCniError};
use crate::integrations::ovsdb::{PortSpec, SwitchDb};
use crate::integrations::Host;
use crate::mac::{format_mac, ip_to_hw_addr};
use crate::types::{CmdArgs, EnvArgs, Interface, Result as CniResult};
use crate::vlan::VlanPolicy;
use bridge::resolve_bridge;
use provision::{configure_iface, parse_ip, setup_veth};
use rollback::Rollback;

/// OVS plugin bound to one invocation.
pub struct OvsPlugin<'h> {
    host: &'h dyn Host,
    args: CmdArgs,
}

/// Poll the port's link state until it reports "up".
pub fn wait_link_up(
    switch: &dyn SwitchDb,
    port: &str,
    retries: u32,
    interval_ms: u64,
) -> Result<()> {
    let retries = retries.max(1);
    for attempt in 1..=retries {
        match switch.port_link_state(port) {
            Ok(state) if state == "up" => return Ok(()),
            Ok(state) => debug!(port, state = %state, attempt, "port not up yet"),
            Err(err) => warn!("error in retrieving port {} state: {:#}", port, err),
        }
        if attempt < retries {
            thread::sleep(Duration::from_millis(interval_ms));
        }
    }
    Err(OvsCniError::PortNotUp(port.to_string()).into())
}

/// Address the container MAC is derived from: first IPv4, else the first address.
fn mac_source(result: &CniResult) -> Result<Option<IpAddr>> {
    let mut first = None;
    for ip in result.ips() {
        let addr = parse_ip(&ip.address)?.ip();
        if addr.is_ipv4() {
            return Ok(Some(addr));
        }
        first.get_or_insert(addr);
    }
    Ok(first)
}

impl<'h> OvsPlugin<'h> {
    pub fn new(host: &'h dyn Host, args: CmdArgs) -> Self {
        Self { host, args }
    }

    fn log_call(&self, command: &str) {
        info!(
            container_id = %self.args.container_id,
            netns = %self.args.netns,
            ifname = %self.args.ifname,
            "CNI {} was called, configuration: {}",
            command,
            String::from_utf8_lossy(&self.args.stdin_data)
        );
    }

    fn env_args(&self) -> Result<EnvArgs> {
        Ok(EnvArgs::from_args(&self.args.args)?)
    }

    fn cache_key(&self) -> String {
        cache_ref(&self.args.container_id, &self.args.ifname)
    }

    /// Attach the container to its bridge.
    pub fn add_network(&self, mut conf: NetConf) -> Result<CniResult> {
        self.log_call("ADD");
        let env = self.env_args()?;
        let policy = VlanPolicy::from_conf(conf.vlan_tag, &conf.trunk)?;

        let switch = self.host.switch(&conf.socket_file)?;
        let offload = self.host.offload();
        let bridge = resolve_bridge(
            &conf.br_name,
            env.ovn_port.as_deref(),
            &conf.device_id,
            switch.as_ref(),
            offload,
        )?;
        conf.br_name = bridge.clone();

        let hw_offload = offload.is_enabled(&conf.device_id);
        let userspace = hw_offload && offload.has_userspace_driver(&conf.device_id)?;

        sweep::clean_ports(switch.as_ref(), &bridge);

        let netns = self.args.netns.as_str();
        let ifname = self.args.ifname.as_str();
        if !self.host.links().namespace_exists(netns) {
            return Err(OvsCniError::NetnsNotFound(netns.to_string()).into());
        }

        let orig_if_name = if hw_offload && !userspace {
            offload.vf_link_name(&conf.device_id)?
        } else {
            String::new()
        };

        let record = CachedNetConf {
            netconf: conf.clone(),
            orig_if_name: orig_if_name.clone(),
            userspace_mode: userspace,
        };
        self.host
            .cache()
            .save(&self.cache_key(), &record)
            .context("error saving NetConf")?;

        let mac = env.mac.as_deref();
        let (host_iface, cont_iface) = if hw_offload {
            offload.setup_vf(&conf.device_id, netns, ifname, &orig_if_name, conf.mtu, mac, userspace)?
        } else {
            setup_veth(self.host.links(), netns, ifname, conf.mtu, mac)?
        };

        let port = PortSpec {
            name: host_iface.name.clone(),
            netns: netns.to_string(),
            container_iface: cont_iface.name.clone(),
            ovn_port: env.ovn_port.clone(),
            ofport_request: conf.ofport_request,
            vlan: policy,
            interface_type: Some(conf.interface_type.clone()).filter(|t| !t.is_empty()),
            pod_uid: env.pod_uid.clone(),
        };
        switch.create_port(&bridge, &port)?;

        let switch_ref = switch.as_ref();
        let bridge_ref = bridge.as_str();
        let mut rollback = Rollback::new();
        rollback.push(format!("OVS port for {}", ifname), move || {
            if let Some(name) = switch_ref.find_port_for_container_iface(ifname, netns)? {
                switch_ref.delete_port(bridge_ref, &name)?;
            }
            Ok(())
        });

        let result = self.finish_attach(
            &conf,
            &env,
            switch_ref,
            &mut rollback,
            host_iface,
            cont_iface,
            hw_offload,
            userspace,
        );
        rollback.settle(result)
    }

    /// Everything after the port exists; failures here unwind `rollback`.
    #[allow(clippy::too_many_arguments)]
    fn finish_attach<'a>(
        &'a self,
        conf: &'a NetConf,
        env: &EnvArgs,
        switch: &dyn SwitchDb,
        rollback: &mut Rollback<'a>,
        host_iface: Interface,
        mut cont_iface: Interface,
        hw_offload: bool,
        userspace: bool,
    ) -> Result<CniResult> {
        let links = self.host.links();
        let netns = self.args.netns.as_str();
        let ifname = self.args.ifname.as_str();

        links.set_up(None, &host_iface.name)?;

        let ipam_type = conf.ipam_type();
        if ipam_type.is_empty() || userspace {
            let mut result = CniResult::new(&conf.cni_version);
            result.add_interface(host_iface);
            result.add_interface(cont_iface);
            return Ok(result);
        }

        let ipam = self.host.ipam();
        let args = &self.args;
        rollback.push(format!("IPAM {}", ipam_type), move || ipam.del(ipam_type, args));
        let mut result = ipam
            .add(ipam_type, args)
            .with_context(|| format!("failed to set up IPAM plugin type {:?}", ipam_type))?;

        wait_link_up(
            switch,
            &host_iface.name,
            conf.link_state_check_retries,
            conf.link_state_check_interval,
        )?;

        if env.mac.is_none() && !hw_offload {
            if let Some(ip) = mac_source(&result)? {
                let mac = format_mac(&ip_to_hw_addr(ip));
                links.set_mac(Some(netns), ifname, &mac)?;
                cont_iface.mac = Some(mac);
            }
        }

        configure_iface(links, netns, ifname, &result)?;

        for ip in result.ips() {
            if let IpAddr::V4(v4) = parse_ip(&ip.address)?.ip() {
                best_effort(
                    format!("gratuitous ARP for {}", v4),
                    links.send_gratuitous_arp(netns, ifname, v4),
                );
            }
        }

        result.cni_version = conf.cni_version.clone();
        result.interfaces = None;
        result.add_interface(host_iface);
        let cont_index = result.add_interface(cont_iface);
        result.assign_ips_to(cont_index);
        Ok(result)
    }

    /// Tear the attachment down; absent state counts as done.
    pub fn del_network(&self) -> Result<()> {
        self.log_call("DEL");
        let key = self.cache_key();
        let cache = match self.host.cache().load(&key) {
            Ok(Some(cache)) => cache,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!("Failed to load cached netconf {}: {:#}", key, err);
                return Ok(());
            }
        };

        self.detach(&cache)?;
        best_effort("cleaning up cache", self.host.cache().delete(&key));
        Ok(())
    }

    fn detach(&self, cache: &CachedNetConf) -> Result<()> {
        let env = self.env_args()?;
        let conf = &cache.netconf;
        let switch = self.host.switch(&conf.socket_file)?;
        let offload = self.host.offload();
        let links = self.host.links();
        let bridge = resolve_bridge(
            &conf.br_name,
            env.ovn_port.as_deref(),
            &conf.device_id,
            switch.as_ref(),
            offload,
        )?;
        let hw_offload = offload.is_enabled(&conf.device_id);

        if !conf.ipam_type().is_empty() {
            self.host.ipam().del(conf.ipam_type(), &self.args)?;
        }

        let netns = self.args.netns.as_str();
        let ifname = self.args.ifname.as_str();

        if netns.is_empty() {
            if hw_offload {
                let rep = offload.representor(&conf.device_id)?;
                best_effort(
                    format!("removal of port {}", rep),
                    switch.delete_port(&bridge, &rep),
                );
                if !cache.userspace_mode {
                    offload.reset_vf(&conf.device_id, &cache.orig_if_name)?;
                }
            } else {
                sweep::clean_ports(switch.as_ref(), &bridge);
            }
            return Ok(());
        }

        let port = switch
            .find_port_for_container_iface(ifname, netns)
            .context("Failed to obtain OVS port for given connection")?;
        if let Some(name) = &port {
            switch.delete_port(&bridge, name)?;
        }

        let mut outcome = Ok(());
        if hw_offload {
            if !cache.userspace_mode {
                if let Err(err) = offload.release_vf(netns, ifname, &cache.orig_if_name) {
                    best_effort(
                        format!("cleanup of VF {}", cache.orig_if_name),
                        offload.reset_vf(&conf.device_id, &cache.orig_if_name),
                    );
                    outcome = Err(err);
                }
            }
        } else if let Err(err) = links.delete_link(Some(netns), ifname) {
            if OvsCniError::is_already_gone(&err) {
                debug!("container link already gone: {:#}", err);
                if let Some(name) = &port {
                    best_effort(format!("cleanup of {}", name), links.delete_link(None, name));
                }
            } else {
                outcome = Err(err);
            }
        }

        sweep::clean_ports(switch.as_ref(), &bridge);
        outcome
    }

    /// Confirm a previous attach still matches `conf`.
    pub fn check_network(&self, mut conf: NetConf) -> Result<()> {
        self.log_call("CHECK");
        let env = self.env_args()?;
        let offload = self.host.offload();
        let links = self.host.links();
        let hw_offload = offload.is_enabled(&conf.device_id);

        let switch = self.host.switch(&conf.socket_file)?;
        conf.br_name = resolve_bridge(
            &conf.br_name,
            env.ovn_port.as_deref(),
            &conf.device_id,
            switch.as_ref(),
            offload,
        )?;

        let key = self.cache_key();
        let cache = self
            .host
            .cache()
            .load(&key)?
            .ok_or(OvsCniError::CacheMissing(key))?;
        verify::validate_cache(&cache, &conf)?;

        if cache.userspace_mode {
            return Ok(());
        }

        if !conf.ipam_type().is_empty() {
            self.host
                .ipam()
                .check(conf.ipam_type(), &self.args)
                .with_context(|| {
                    format!("failed to check with IPAM plugin type {:?}", conf.ipam_type())
                })?;
        }

        let prev = conf
            .prev_result
            .clone()
            .ok_or_else(|| OvsCniError::Verification("Required prevResult missing".into()))?;
        let prev: CniResult =
            serde_json::from_value(prev).context("failed to parse prevResult")?;

        let netns = self.args.netns.as_str();
        let ifname = self.args.ifname.as_str();
        let mut cont_iface = None;
        let mut host_iface = None;
        for intf in prev.interfaces() {
            if intf.name == ifname {
                if intf.sandbox_path() == netns {
                    cont_iface = Some(intf);
                }
            } else {
                verify::validate_interface(links, None, intf, true, hw_offload)?;
                host_iface = Some(intf);
            }
        }

        let cont_iface = match cont_iface {
            Some(intf) => intf,
            None => {
                return Err(OvsCniError::Verification(format!(
                    "Sandbox in prevResult doesn't match configured netns: {}",
                    netns
                ))
                .into())
            }
        };

        verify::validate_interface(links, Some(netns), cont_iface, false, hw_offload)?;
        verify::validate_ips(links, netns, ifname, prev.ips())?;
        verify::validate_routes(links, netns, prev.routes())?;

        let host_name = host_iface.map(|i| i.name.as_str()).unwrap_or_default();
        let policy = VlanPolicy::from_conf(conf.vlan_tag, &conf.trunk)?;
        verify::validate_switch(switch.as_ref(), &conf.br_name, &policy, host_name)
    }
}
