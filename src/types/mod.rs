use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::OvsCniError;

/// CNI versions this plugin understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Result versions whose `ips[]` entries carry an address family.
const VERSIONED_IP_RESULTS: &[&str] = &["0.3.0", "0.3.1", "0.4.0"];

/// CNI command arguments
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path (may be empty on DEL)
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

impl CmdArgs {
    /// Re-encode `args` in the `K=V;K=V` form used by `CNI_ARGS`.
    pub fn args_string(&self) -> String {
        self.args
            .iter()
            .sorted()
            .map(|(k, v)| format!("{}={}", k, v))
            .join(";")
    }
}

/// Keys understood in `CNI_ARGS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvArgs {
    /// MAC requested for the container interface
    pub mac: Option<String>,
    /// OVN logical port the interface belongs to
    pub ovn_port: Option<String>,
    /// Kubernetes pod UID
    pub pod_uid: Option<String>,
}

impl EnvArgs {
    const KNOWN: &'static [&'static str] = &[
        "IgnoreUnknown",
        "MAC",
        "OvnPort",
        "K8S_POD_UID",
        "K8S_POD_NAME",
        "K8S_POD_NAMESPACE",
        "K8S_POD_INFRA_CONTAINER_ID",
    ];

    /// Pick the plugin's keys out of parsed `CNI_ARGS`.
    ///
    /// Unknown keys are rejected unless `IgnoreUnknown` is set.
    pub fn from_args(args: &HashMap<String, String>) -> std::result::Result<Self, OvsCniError> {
        let ignore_unknown = args
            .get("IgnoreUnknown")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if !ignore_unknown {
            let mut unknown: Vec<_> = args
                .keys()
                .filter(|k| !Self::KNOWN.contains(&k.as_str()))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                unknown.sort();
                return Err(OvsCniError::InvalidConfig(format!(
                    "unknown CNI_ARGS keys: {}",
                    unknown.join(", ")
                )));
            }
        }

        let non_empty = |key: &str| args.get(key).filter(|v| !v.is_empty()).cloned();
        Ok(Self {
            mac: non_empty("MAC"),
            ovn_port: non_empty("OvnPort"),
            pod_uid: non_empty("K8S_POD_UID"),
        })
    }
}

/// Current result format (CNI 1.0.0)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// DNS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
    /// Routes to configure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
}

/// Interface information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

impl Interface {
    pub fn new(name: &str, mac: Option<String>, sandbox: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            mac,
            sandbox,
        }
    }

    pub fn sandbox_path(&self) -> &str {
        self.sandbox.as_deref().unwrap_or("")
    }
}

/// IP configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IPConfig {
    /// Address family, "4" or "6"; only present in pre-1.0.0 results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Interface index this IP is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// DNS search domains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// DNS options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            ..Self::default()
        }
    }

    /// Add an interface to the result, returning its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    pub fn interfaces(&self) -> &[Interface] {
        self.interfaces.as_deref().unwrap_or(&[])
    }

    pub fn ips(&self) -> &[IPConfig] {
        self.ips.as_deref().unwrap_or(&[])
    }

    pub fn routes(&self) -> &[Route] {
        self.routes.as_deref().unwrap_or(&[])
    }

    /// Point every IP at the interface at `index`.
    pub fn assign_ips_to(&mut self, index: usize) {
        for ip in self.ips.iter_mut().flatten() {
            ip.interface = Some(index);
        }
    }

    /// Reshape the result for `cni_version`.
    ///
    /// Releases before 1.0.0 require `ips[].version`; 1.0.0 drops it.
    pub fn convert_to(&self, cni_version: &str) -> std::result::Result<Self, OvsCniError> {
        if !SUPPORTED_VERSIONS.contains(&cni_version) {
            return Err(OvsCniError::InvalidConfig(format!(
                "unsupported CNI result version {:?}",
                cni_version
            )));
        }
        let versioned = VERSIONED_IP_RESULTS.contains(&cni_version);
        let mut converted = self.clone();
        converted.cni_version = cni_version.to_string();
        for ip in converted.ips.iter_mut().flatten() {
            ip.version = if versioned {
                Some(ip_family(&ip.address)?.to_string())
            } else {
                None
            };
        }
        Ok(converted)
    }

    /// Print result as JSON, shaped for its own `cniVersion`
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.convert_to(&self.cni_version)?)?;
        println!("{}", json);
        Ok(())
    }
}

fn ip_family(address: &str) -> std::result::Result<&'static str, OvsCniError> {
    let ip = address
        .split('/')
        .next()
        .and_then(|ip| ip.parse::<IpAddr>().ok())
        .ok_or_else(|| OvsCniError::InvalidConfig(format!("invalid address {:?}", address)))?;
    Ok(if ip.is_ipv4() { "4" } else { "6" })
}

/// Error object written to stdout when a command fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniError {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniError {
    pub fn from_error(cni_version: &str, err: &anyhow::Error) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: OvsCniError::code_of(err),
            msg: err.to_string(),
            details: format!("{:#}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn env_args_pick_known_keys() {
        let env = EnvArgs::from_args(&args(&[
            ("MAC", "0a:58:0a:00:00:05"),
            ("OvnPort", "pod1"),
            ("K8S_POD_UID", "uid-1"),
        ]))
        .unwrap();
        assert_eq!(env.mac.as_deref(), Some("0a:58:0a:00:00:05"));
        assert_eq!(env.ovn_port.as_deref(), Some("pod1"));
        assert_eq!(env.pod_uid.as_deref(), Some("uid-1"));
    }

    #[test]
    fn env_args_reject_unknown_unless_ignored() {
        assert!(EnvArgs::from_args(&args(&[("FOO", "bar")])).is_err());
        let env = EnvArgs::from_args(&args(&[("FOO", "bar"), ("IgnoreUnknown", "1")])).unwrap();
        assert_eq!(env, EnvArgs::default());
    }

    fn with_ips(cni_version: &str, addresses: &[&str]) -> Result {
        let mut result = Result::new(cni_version);
        for address in addresses {
            result.add_ip(IPConfig {
                version: None,
                interface: Some(1),
                address: address.to_string(),
                gateway: None,
            });
        }
        result
    }

    #[test]
    fn legacy_ip_fields_are_read() {
        let raw = r#"{"cniVersion":"0.4.0","ips":[{"version":"4","address":"10.0.0.5/24","gateway":"10.0.0.1","interface":0}]}"#;
        let result: Result = serde_json::from_str(raw).unwrap();
        assert_eq!(result.ips()[0].address, "10.0.0.5/24");
        assert_eq!(result.ips()[0].version.as_deref(), Some("4"));
    }

    #[test]
    fn older_results_carry_ip_family() {
        let result = with_ips("0.4.0", &["10.0.0.5/24", "fd00::5/64"]);
        let json = serde_json::to_value(result.convert_to("0.4.0").unwrap()).unwrap();
        assert_eq!(json["cniVersion"], "0.4.0");
        assert_eq!(json["ips"][0]["version"], "4");
        assert_eq!(json["ips"][1]["version"], "6");
        assert_eq!(json["ips"][0]["interface"], 1);

        let json = serde_json::to_value(result.convert_to("0.3.1").unwrap()).unwrap();
        assert_eq!(json["ips"][1]["version"], "6");
    }

    #[test]
    fn current_results_drop_ip_family() {
        let mut result = with_ips("1.0.0", &["10.0.0.5/24"]);
        result.ips.as_mut().unwrap()[0].version = Some("4".into());
        let json = serde_json::to_value(result.convert_to("1.0.0").unwrap()).unwrap();
        assert!(json["ips"][0].get("version").is_none());
    }

    #[test]
    fn unknown_result_version_is_refused() {
        let result = with_ips("0.2.0", &["10.0.0.5/24"]);
        assert!(result.convert_to("0.2.0").is_err());
        assert!(with_ips("0.4.0", &["bogus"]).convert_to("0.4.0").is_err());
    }
}
