use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::OvsCniError;
use crate::vlan::Trunk;

/// Default OVSDB endpoint.
pub const DEFAULT_SOCKET_FILE: &str = "unix:/var/run/openvswitch/db.sock";
/// Default number of link state polls before giving up.
pub const DEFAULT_LINK_STATE_CHECK_RETRIES: u32 = 5;
/// Default pause between link state polls, in milliseconds.
pub const DEFAULT_LINK_STATE_CHECK_INTERVAL: u64 = 1000;

/// Process-wide settings for the plugin and its control tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Path to the CNI bin directory
    pub cni_bin_dir: PathBuf,
    /// Path to the CNI config directory
    pub cni_conf_dir: PathBuf,
    /// Directory holding cached attachment records
    pub cache_dir: PathBuf,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            cache_dir: PathBuf::from("/var/lib/cni/ovs-cni/cache"),
        }
    }
}

impl PluginConfig {
    /// Defaults overridden by `OVS_CNI_CACHE_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os("OVS_CNI_CACHE_DIR").filter(|d| !d.is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }
        config
    }
}

/// Network configuration for the OVS CNI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Bridge to attach to; empty means discover it
    #[serde(rename = "bridge", default)]
    pub br_name: String,
    /// Access VLAN tag
    #[serde(rename = "vlan", default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u32>,
    /// Trunk VLAN ids and ranges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trunk: Vec<Trunk>,
    /// Interface MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// PCI address of an SR-IOV virtual function
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    /// OVSDB endpoint
    #[serde(default)]
    pub socket_file: String,
    /// Optional overlay file with plugin defaults
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub configuration_path: String,
    #[serde(default)]
    pub link_state_check_retries: u32,
    /// Milliseconds between link state polls
    #[serde(default)]
    pub link_state_check_interval: u64,
    /// Requested OpenFlow port number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ofport_request: Option<u32>,
    /// OVS interface type, e.g. "dpdk"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface_type: String,
    /// IPAM configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IPAMConfig>,
    /// Result of the previous ADD, present on CHECK
    #[serde(rename = "prevResult", default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<serde_json::Value>,
}

/// IPAM (IP Address Management) configuration
///
/// Only `type` is interpreted; the rest belongs to the IPAM plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IPAMConfig {
    /// Type of IPAM plugin
    #[serde(rename = "type", default)]
    pub ipam_type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Defaults read from `configuration_path`.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    socket_file: Option<String>,
    link_state_check_retries: Option<u32>,
    link_state_check_interval: Option<u64>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| OvsCniError::InvalidConfig(format!("failed to load netconf: {}", e)))?;

        if !conf.configuration_path.is_empty() {
            let overlay = load_overlay(Path::new(&conf.configuration_path))?;
            if conf.socket_file.is_empty() {
                conf.socket_file = overlay.socket_file.unwrap_or_default();
            }
            if conf.link_state_check_retries == 0 {
                conf.link_state_check_retries = overlay.link_state_check_retries.unwrap_or(0);
            }
            if conf.link_state_check_interval == 0 {
                conf.link_state_check_interval = overlay.link_state_check_interval.unwrap_or(0);
            }
        }

        conf.apply_defaults();
        conf.validate()?;
        Ok(conf)
    }

    fn apply_defaults(&mut self) {
        if self.socket_file.is_empty() {
            self.socket_file = DEFAULT_SOCKET_FILE.to_string();
        }
        if self.link_state_check_retries == 0 {
            self.link_state_check_retries = DEFAULT_LINK_STATE_CHECK_RETRIES;
        }
        if self.link_state_check_interval == 0 {
            self.link_state_check_interval = DEFAULT_LINK_STATE_CHECK_INTERVAL;
        }
    }

    fn validate(&self) -> Result<(), OvsCniError> {
        if let Some(tag) = self.vlan_tag {
            if tag > 4095 {
                return Err(OvsCniError::InvalidConfig(format!(
                    "invalid VLAN tag {} (must be between 0 and 4095)",
                    tag
                )));
            }
            if !self.trunk.is_empty() {
                return Err(OvsCniError::InvalidConfig(
                    "vlan and trunk are mutually exclusive".into(),
                ));
            }
        }
        Ok(())
    }

    /// Type of the configured IPAM plugin, empty when none.
    pub fn ipam_type(&self) -> &str {
        self.ipam.as_ref().map(|i| i.ipam_type.as_str()).unwrap_or("")
    }

    /// Create a default configuration attached to `bridge`
    pub fn new_default(name: &str, bridge: &str, vlan: Option<u32>, mtu: Option<u32>) -> Self {
        let mut conf = Self {
            cni_version: "1.0.0".to_string(),
            name: name.to_string(),
            plugin_type: "ovs".to_string(),
            br_name: bridge.to_string(),
            vlan_tag: vlan,
            trunk: Vec::new(),
            mtu,
            device_id: String::new(),
            socket_file: String::new(),
            configuration_path: String::new(),
            link_state_check_retries: 0,
            link_state_check_interval: 0,
            ofport_request: None,
            interface_type: String::new(),
            ipam: None,
            prev_result: None,
        };
        conf.apply_defaults();
        conf
    }

    /// Save configuration to a file
    pub fn save(&self, path: PathBuf) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn load_overlay(path: &Path) -> Result<ConfigOverlay> {
    let data = fs::read(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    let overlay = serde_json::from_slice(&data).map_err(|e| {
        OvsCniError::InvalidConfig(format!("failed to parse {}: {}", path.display(), e))
    })?;
    Ok(overlay)
}

/// Record persisted by ADD and consumed by DEL and CHECK
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedNetConf {
    /// Configuration with the resolved bridge name filled in
    #[serde(rename = "netconf")]
    pub netconf: NetConf,
    /// Host name of the VF before it was moved into the container
    #[serde(rename = "origIfName", default)]
    pub orig_if_name: String,
    /// VF bound to a userspace driver, no kernel interface on the host
    #[serde(rename = "userspaceMode", default)]
    pub userspace_mode: bool,
}

/// Cache key for one container interface.
pub fn cache_ref(container_id: &str, ifname: &str) -> String {
    format!("{}-{}", container_id, ifname)
}

/// Installer for the OVS CNI plugin
pub struct Installer {
    config: PluginConfig,
}

impl Installer {
    /// Create a new installer
    pub fn new(config: PluginConfig) -> Self {
        Self { config }
    }

    /// Create the plugin directories and a default network list
    pub fn install(&self, bridge: &str) -> Result<PathBuf> {
        for dir in [&self.config.cni_bin_dir, &self.config.cni_conf_dir, &self.config.cache_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let config_path = self.config.cni_conf_dir.join("10-ovs.conflist");
        let config = serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "ovs-cni",
            "plugins": [
                {
                    "type": "ovs",
                    "bridge": bridge,
                    "ipam": {
                        "type": "host-local",
                        "subnet": "10.10.0.0/24"
                    }
                }
            ]
        });

        fs::write(&config_path, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("Failed to write CNI config to {}", config_path.display()))?;

        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_applies_defaults() {
        let conf = NetConf::parse(br#"{"cniVersion":"1.0.0","name":"n","type":"ovs","bridge":"br0"}"#)
            .unwrap();
        assert_eq!(conf.socket_file, DEFAULT_SOCKET_FILE);
        assert_eq!(conf.link_state_check_retries, DEFAULT_LINK_STATE_CHECK_RETRIES);
        assert_eq!(conf.link_state_check_interval, DEFAULT_LINK_STATE_CHECK_INTERVAL);
        assert_eq!(conf.ipam_type(), "");
    }

    #[test]
    fn parse_keeps_ipam_passthrough() {
        let conf = NetConf::parse(
            br#"{"cniVersion":"1.0.0","name":"n","type":"ovs","bridge":"br0",
                "ipam":{"type":"host-local","subnet":"10.1.0.0/24"}}"#,
        )
        .unwrap();
        let ipam = conf.ipam.unwrap();
        assert_eq!(ipam.ipam_type, "host-local");
        assert_eq!(ipam.extra["subnet"], "10.1.0.0/24");
    }

    #[test]
    fn vlan_and_trunk_are_exclusive() {
        let err = NetConf::parse(
            br#"{"cniVersion":"1.0.0","name":"n","type":"ovs","vlan":10,"trunk":[{"id":11}]}"#,
        )
        .unwrap_err();
        assert_eq!(OvsCniError::code_of(&err), crate::error::CODE_INVALID_CONFIG);
    }

    #[test]
    fn overlay_fills_unset_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ovs.conf");
        fs::write(&path, r#"{"socket_file":"unix:/tmp/db.sock","link_state_check_retries":9}"#).unwrap();
        let payload = serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "n",
            "type": "ovs",
            "configuration_path": path,
            "link_state_check_retries": 2
        });
        let conf = NetConf::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(conf.socket_file, "unix:/tmp/db.sock");
        assert_eq!(conf.link_state_check_retries, 2);
    }

    #[test]
    fn cache_ref_joins_container_and_ifname() {
        assert_eq!(cache_ref("abc", "eth1"), "abc-eth1");
    }
}
