// In-memory host shared by the integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use ipnetwork::IpNetwork;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};

use ovs_cni::config::CachedNetConf;
use ovs_cni::integrations::cache::CacheStore;
use ovs_cni::integrations::ipam::Ipam;
use ovs_cni::integrations::netlink::{LinkInfo, LinkOps, RouteEntry};
use ovs_cni::integrations::ovsdb::{PortSpec, PortVlanState, SwitchDb};
use ovs_cni::integrations::sriov::Offload;
use ovs_cni::integrations::Host;
use ovs_cni::types::{CmdArgs, Interface, Result as CniResult};
use ovs_cni::OvsCniError;

pub const NETNS: &str = "/var/run/netns/pod1";
pub const IFNAME: &str = "eth1";
pub const CONTAINER_ID: &str = "c0ffee";

#[derive(Debug, Clone)]
pub struct FakePort {
    pub bridge: String,
    pub netns: String,
    pub container_iface: String,
    pub vlan: PortVlanState,
    pub link_state: String,
    pub ovn_port: Option<String>,
    pub pod_uid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FakeVf {
    pub userspace: bool,
    pub uplinks: Vec<String>,
    pub netdev: String,
    pub representor: String,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub namespaces: BTreeSet<String>,
    pub bridges: BTreeSet<String>,
    /// uplink interface -> owning bridge
    pub uplinks: HashMap<String, String>,
    pub ports: BTreeMap<String, FakePort>,
    pub errored: Vec<String>,
    /// (netns or "", name) -> link
    pub links: BTreeMap<(String, String), LinkInfo>,
    pub peers: HashMap<(String, String), (String, String)>,
    pub addresses: HashMap<(String, String), Vec<IpNetwork>>,
    pub routes: HashMap<String, Vec<RouteEntry>>,
    pub garps: Vec<Ipv4Addr>,
    pub vfs: HashMap<String, FakeVf>,
    pub ipam_result: Option<CniResult>,
    pub ipam_fails: bool,
    pub ipam_calls: Vec<String>,
    pub cache: HashMap<String, CachedNetConf>,
    pub port_link_state: String,
    /// Every mutating operation, in order
    pub ops: Vec<String>,
    /// Operations that fail when called, see [`FakeHost::fail_on`]
    pub failing: BTreeSet<&'static str>,
    next_mac: u8,
}

pub struct FakeHost {
    pub state: RefCell<FakeState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

fn ns_key(netns: Option<&str>) -> String {
    netns.unwrap_or_default().to_string()
}

impl FakeHost {
    /// A host with namespace [`NETNS`] and bridge `br0`.
    pub fn new() -> Self {
        let mut state = FakeState {
            port_link_state: "up".into(),
            ..FakeState::default()
        };
        state.namespaces.insert(NETNS.to_string());
        state.bridges.insert("br0".to_string());
        Self { state: RefCell::new(state) }
    }

    pub fn with_ipam(self, addresses: &[(&str, Option<&str>)]) -> Self {
        let mut result = CniResult::new("1.0.0");
        for (address, gateway) in addresses {
            result.add_ip(ovs_cni::types::IPConfig {
                version: None,
                interface: None,
                address: address.to_string(),
                gateway: gateway.map(String::from),
            });
        }
        result.add_route(ovs_cni::types::Route {
            dst: "0.0.0.0/0".into(),
            gw: None,
        });
        self.state.borrow_mut().ipam_result = Some(result);
        self
    }

    /// Make `op` ("garp", "set-mac", "add-address", "release-vf") fail from now on.
    pub fn fail_on(self, op: &'static str) -> Self {
        self.state.borrow_mut().failing.insert(op);
        self
    }

    fn injected(&self, op: &str) -> Result<()> {
        if self.state.borrow().failing.contains(op) {
            bail!("injected {} failure", op);
        }
        Ok(())
    }

    fn check_ns(&self, netns: Option<&str>) -> Result<()> {
        if let Some(path) = netns {
            if !self.state.borrow().namespaces.contains(path) {
                return Err(OvsCniError::NetnsNotFound(path.to_string()).into());
            }
        }
        Ok(())
    }

    fn new_mac(state: &mut FakeState) -> String {
        state.next_mac += 1;
        format!("02:00:00:00:00:{:02x}", state.next_mac)
    }

    pub fn insert_link(&self, netns: Option<&str>, name: &str, kind: Option<&str>) {
        let mut state = self.state.borrow_mut();
        let mac = Self::new_mac(&mut state);
        state.links.insert(
            (ns_key(netns), name.to_string()),
            LinkInfo {
                name: name.to_string(),
                mac,
                kind: kind.map(String::from),
                oper_state: "DOWN".into(),
            },
        );
    }

    pub fn has_link(&self, netns: Option<&str>, name: &str) -> bool {
        self.state
            .borrow()
            .links
            .contains_key(&(ns_key(netns), name.to_string()))
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.borrow().ops.clone()
    }

    pub fn port_names(&self) -> Vec<String> {
        self.state.borrow().ports.keys().cloned().collect()
    }
}

pub struct FakeSwitch<'a>(&'a FakeHost);

impl SwitchDb for FakeSwitch<'_> {
    fn create_port(&self, bridge: &str, port: &PortSpec) -> Result<()> {
        let mut state = self.0.state.borrow_mut();
        if !state.bridges.contains(bridge) {
            return Err(OvsCniError::Ovsdb(format!("bridge {} not found", bridge)).into());
        }
        let link_state = state.port_link_state.clone();
        state.ports.insert(
            port.name.clone(),
            FakePort {
                bridge: bridge.to_string(),
                netns: port.netns.clone(),
                container_iface: port.container_iface.clone(),
                vlan: PortVlanState {
                    mode: port.vlan.mode().to_string(),
                    tag: port.vlan.tag(),
                    trunks: port.vlan.trunks().to_vec(),
                },
                link_state,
                ovn_port: port.ovn_port.clone(),
                pod_uid: port.pod_uid.clone(),
            },
        );
        state.ops.push(format!("create-port {}", port.name));
        Ok(())
    }

    fn delete_port(&self, bridge: &str, port_name: &str) -> Result<()> {
        let mut state = self.0.state.borrow_mut();
        if !state.ports.get(port_name).is_some_and(|p| p.bridge == bridge) {
            return Err(OvsCniError::Ovsdb(format!("port {} not found", port_name)).into());
        }
        state.ports.remove(port_name);
        state.errored.retain(|i| i != port_name);
        state.ops.push(format!("delete-port {}", port_name));
        Ok(())
    }

    fn find_port_for_container_iface(&self, container_iface: &str, netns: &str) -> Result<Option<String>> {
        Ok(self
            .0
            .state
            .borrow()
            .ports
            .iter()
            .find(|(_, p)| p.container_iface == container_iface && p.netns == netns)
            .map(|(name, _)| name.clone()))
    }

    fn interfaces_in_error(&self) -> Result<Vec<String>> {
        Ok(self.0.state.borrow().errored.clone())
    }

    fn bridge_exists(&self, bridge: &str) -> Result<bool> {
        Ok(self.0.state.borrow().bridges.contains(bridge))
    }

    fn bridge_for_interface(&self, iface: &str) -> Result<String> {
        self.0
            .state
            .borrow()
            .uplinks
            .get(iface)
            .cloned()
            .ok_or_else(|| anyhow!("interface {} not found", iface))
    }

    fn port_link_state(&self, port_name: &str) -> Result<String> {
        self.0
            .state
            .borrow()
            .ports
            .get(port_name)
            .map(|p| p.link_state.clone())
            .ok_or_else(|| anyhow!("interface {} not found", port_name))
    }

    fn port_vlan_state(&self, port_name: &str) -> Result<PortVlanState> {
        self.0
            .state
            .borrow()
            .ports
            .get(port_name)
            .map(|p| p.vlan.clone())
            .ok_or_else(|| anyhow!("port {} not found", port_name))
    }
}

impl LinkOps for FakeHost {
    fn namespace_exists(&self, netns: &str) -> bool {
        self.state.borrow().namespaces.contains(netns)
    }

    fn add_veth(&self, netns: &str, ifname: &str, host_name: &str, _mtu: Option<u32>, mac: Option<&str>) -> Result<()> {
        self.check_ns(Some(netns))?;
        if self.has_link(Some(netns), ifname) {
            bail!("RTNETLINK answers: File exists");
        }
        self.insert_link(Some(netns), ifname, Some("veth"));
        self.insert_link(None, host_name, Some("veth"));
        let mut state = self.state.borrow_mut();
        let cont = (netns.to_string(), ifname.to_string());
        let host = (String::new(), host_name.to_string());
        if let Some(mac) = mac {
            if let Some(link) = state.links.get_mut(&cont) {
                link.mac = mac.to_string();
            }
        }
        state.peers.insert(cont.clone(), host.clone());
        state.peers.insert(host, cont);
        state.ops.push(format!("add-veth {} {}", host_name, ifname));
        Ok(())
    }

    fn link(&self, netns: Option<&str>, name: &str) -> Result<LinkInfo> {
        self.check_ns(netns)?;
        self.state
            .borrow()
            .links
            .get(&(ns_key(netns), name.to_string()))
            .cloned()
            .ok_or_else(|| OvsCniError::LinkNotFound(name.to_string()).into())
    }

    fn set_up(&self, netns: Option<&str>, name: &str) -> Result<()> {
        self.check_ns(netns)?;
        let mut state = self.state.borrow_mut();
        let link = state
            .links
            .get_mut(&(ns_key(netns), name.to_string()))
            .ok_or_else(|| OvsCniError::LinkNotFound(name.to_string()))?;
        link.oper_state = "UP".into();
        Ok(())
    }

    fn set_mac(&self, netns: Option<&str>, name: &str, mac: &str) -> Result<()> {
        self.check_ns(netns)?;
        self.injected("set-mac")?;
        let mut state = self.state.borrow_mut();
        let link = state
            .links
            .get_mut(&(ns_key(netns), name.to_string()))
            .ok_or_else(|| OvsCniError::LinkNotFound(name.to_string()))?;
        link.mac = mac.to_string();
        Ok(())
    }

    fn delete_link(&self, netns: Option<&str>, name: &str) -> Result<()> {
        self.check_ns(netns)?;
        let mut state = self.state.borrow_mut();
        let key = (ns_key(netns), name.to_string());
        if state.links.remove(&key).is_none() {
            return Err(OvsCniError::LinkNotFound(name.to_string()).into());
        }
        if let Some(peer) = state.peers.remove(&key) {
            state.links.remove(&peer);
            state.peers.remove(&peer);
        }
        state.ops.push(format!("delete-link {}", name));
        Ok(())
    }

    fn add_address(&self, netns: Option<&str>, name: &str, addr: &IpNetwork) -> Result<()> {
        self.link(netns, name)?;
        self.injected("add-address")?;
        self.state
            .borrow_mut()
            .addresses
            .entry((ns_key(netns), name.to_string()))
            .or_default()
            .push(*addr);
        Ok(())
    }

    fn add_route(&self, netns: Option<&str>, name: &str, dst: &IpNetwork, gateway: Option<IpAddr>) -> Result<()> {
        self.link(netns, name)?;
        self.state
            .borrow_mut()
            .routes
            .entry(ns_key(netns))
            .or_default()
            .push(RouteEntry {
                dst: *dst,
                gateway,
                dev: Some(name.to_string()),
            });
        Ok(())
    }

    fn addresses(&self, netns: Option<&str>, name: &str) -> Result<Vec<IpNetwork>> {
        self.link(netns, name)?;
        Ok(self
            .state
            .borrow()
            .addresses
            .get(&(ns_key(netns), name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn routes(&self, netns: Option<&str>) -> Result<Vec<RouteEntry>> {
        self.check_ns(netns)?;
        Ok(self
            .state
            .borrow()
            .routes
            .get(&ns_key(netns))
            .cloned()
            .unwrap_or_default())
    }

    fn send_gratuitous_arp(&self, netns: &str, name: &str, ip: Ipv4Addr) -> Result<()> {
        self.link(Some(netns), name)?;
        self.injected("garp")?;
        self.state.borrow_mut().garps.push(ip);
        Ok(())
    }
}

impl Offload for FakeHost {
    fn is_enabled(&self, device_id: &str) -> bool {
        self.state.borrow().vfs.contains_key(device_id)
    }

    fn has_userspace_driver(&self, device_id: &str) -> Result<bool> {
        self.state
            .borrow()
            .vfs
            .get(device_id)
            .map(|vf| vf.userspace)
            .ok_or_else(|| anyhow!("no VF {}", device_id))
    }

    fn uplink_candidates(&self, device_id: &str) -> Result<Vec<String>> {
        self.state
            .borrow()
            .vfs
            .get(device_id)
            .map(|vf| vf.uplinks.clone())
            .ok_or_else(|| anyhow!("no VF {}", device_id))
    }

    fn vf_link_name(&self, device_id: &str) -> Result<String> {
        self.state
            .borrow()
            .vfs
            .get(device_id)
            .map(|vf| vf.netdev.clone())
            .ok_or_else(|| anyhow!("no VF {}", device_id))
    }

    fn setup_vf(
        &self,
        device_id: &str,
        netns: &str,
        ifname: &str,
        orig_name: &str,
        _mtu: Option<u32>,
        _mac: Option<&str>,
        userspace: bool,
    ) -> Result<(Interface, Interface)> {
        let rep = self.representor(device_id)?;
        let host = Interface::new(&rep, Some(self.link(None, &rep)?.mac), None);
        if userspace {
            return Ok((host, Interface::new(ifname, None, Some(netns.to_string()))));
        }
        let mut state = self.state.borrow_mut();
        let mut link = state
            .links
            .remove(&(String::new(), orig_name.to_string()))
            .ok_or_else(|| OvsCniError::LinkNotFound(orig_name.to_string()))?;
        link.name = ifname.to_string();
        let mac = link.mac.clone();
        state.links.insert((netns.to_string(), ifname.to_string()), link);
        state.ops.push(format!("setup-vf {}", device_id));
        Ok((host, Interface::new(ifname, Some(mac), Some(netns.to_string()))))
    }

    fn representor(&self, device_id: &str) -> Result<String> {
        self.state
            .borrow()
            .vfs
            .get(device_id)
            .map(|vf| vf.representor.clone())
            .ok_or_else(|| anyhow!("no VF {}", device_id))
    }

    fn release_vf(&self, netns: &str, ifname: &str, orig_name: &str) -> Result<()> {
        self.check_ns(Some(netns))?;
        self.injected("release-vf")?;
        let mut state = self.state.borrow_mut();
        let mut link = state
            .links
            .remove(&(netns.to_string(), ifname.to_string()))
            .ok_or_else(|| OvsCniError::LinkNotFound(ifname.to_string()))?;
        link.name = orig_name.to_string();
        state.links.insert((String::new(), orig_name.to_string()), link);
        state.ops.push(format!("release-vf {}", orig_name));
        Ok(())
    }

    fn reset_vf(&self, device_id: &str, orig_name: &str) -> Result<()> {
        self.state
            .borrow_mut()
            .ops
            .push(format!("reset-vf {} {}", device_id, orig_name));
        Ok(())
    }
}

impl Ipam for FakeHost {
    fn add(&self, plugin: &str, _args: &CmdArgs) -> Result<CniResult> {
        let mut state = self.state.borrow_mut();
        state.ipam_calls.push(format!("ADD {}", plugin));
        if state.ipam_fails {
            return Err(OvsCniError::Ipam {
                plugin: plugin.to_string(),
                msg: "no addresses left".into(),
            }
            .into());
        }
        state
            .ipam_result
            .clone()
            .ok_or_else(|| anyhow!("IPAM plugin returned missing IP config"))
    }

    fn del(&self, plugin: &str, _args: &CmdArgs) -> Result<()> {
        self.state.borrow_mut().ipam_calls.push(format!("DEL {}", plugin));
        Ok(())
    }

    fn check(&self, plugin: &str, _args: &CmdArgs) -> Result<()> {
        self.state.borrow_mut().ipam_calls.push(format!("CHECK {}", plugin));
        Ok(())
    }
}

impl CacheStore for FakeHost {
    fn save(&self, key: &str, record: &CachedNetConf) -> Result<()> {
        self.state.borrow_mut().cache.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<CachedNetConf>> {
        Ok(self.state.borrow().cache.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.state.borrow_mut().cache.remove(key);
        Ok(())
    }
}

impl Host for FakeHost {
    fn switch(&self, _socket_file: &str) -> Result<Box<dyn SwitchDb + '_>> {
        Ok(Box::new(FakeSwitch(self)))
    }

    fn links(&self) -> &dyn LinkOps {
        self
    }

    fn offload(&self) -> &dyn Offload {
        self
    }

    fn ipam(&self) -> &dyn Ipam {
        self
    }

    fn cache(&self) -> &dyn CacheStore {
        self
    }
}

/// CNI arguments for [`CONTAINER_ID`]/[`IFNAME`] in `netns`.
pub fn cmd_args(netns: &str, payload: &serde_json::Value) -> CmdArgs {
    CmdArgs {
        container_id: CONTAINER_ID.to_string(),
        netns: netns.to_string(),
        ifname: IFNAME.to_string(),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: payload.to_string().into_bytes(),
    }
}

/// A minimal network payload on `br0` with `extra` merged in.
pub fn payload(extra: serde_json::Value) -> serde_json::Value {
    let mut base = serde_json::json!({
        "cniVersion": "1.0.0",
        "name": "ovs-net",
        "type": "ovs",
        "bridge": "br0",
        "link_state_check_interval": 1,
    });
    if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    base
}
