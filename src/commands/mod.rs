use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};

use crate::config::{NetConf, PluginConfig};
use crate::integrations::netns::lock_os_thread;
use crate::integrations::{Host, SystemHost};
use crate::plugin::OvsPlugin;
use crate::types::{CmdArgs, CniError, SUPPORTED_VERSIONS};

const DEFAULT_ERROR_VERSION: &str = "1.0.0";

/// Build [`CmdArgs`] from CNI variables supplied by `lookup`.
///
/// `CNI_NETNS` may be empty only for DEL.
pub fn parse_args_from<F>(command: &str, lookup: F, stdin_data: Vec<u8>) -> Result<CmdArgs>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        lookup(key)
            .filter(|v| !v.is_empty())
            .with_context(|| format!("{} not found in environment", key))
    };

    let container_id = required("CNI_CONTAINERID")?;
    let ifname = required("CNI_IFNAME")?;
    let netns = if command == "DEL" {
        lookup("CNI_NETNS").unwrap_or_default()
    } else {
        required("CNI_NETNS")?
    };
    let path = lookup("CNI_PATH").unwrap_or_default();
    let args = parse_cni_args(&lookup("CNI_ARGS").unwrap_or_default())?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse command arguments from environment
pub fn parse_args(command: &str) -> Result<CmdArgs> {
    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;
    parse_args_from(command, |key| env::var(key).ok(), stdin_data)
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> Result<HashMap<String, String>> {
    let mut args = HashMap::new();
    for pair in args_str.split(';').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) => {
                args.insert(key.to_string(), value.to_string());
            }
            None => bail!("ARGS: invalid pair {:?}", pair),
        }
    }
    Ok(args)
}

/// Execute the add command
pub fn cmd_add(host: &dyn Host, args: CmdArgs) -> Result<()> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let result = OvsPlugin::new(host, args).add_network(conf)?;
    result.print()
}

/// Execute the delete command
pub fn cmd_del(host: &dyn Host, args: CmdArgs) -> Result<()> {
    OvsPlugin::new(host, args).del_network()
}

/// Execute the check command
pub fn cmd_check(host: &dyn Host, args: CmdArgs) -> Result<()> {
    let conf = NetConf::parse(&args.stdin_data)?;
    OvsPlugin::new(host, args).check_network(conf)
}

fn version_info() -> serde_json::Value {
    serde_json::json!({
        "cniVersion": DEFAULT_ERROR_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

/// `cniVersion` of the payload, for error reporting.
fn payload_version(stdin_data: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(stdin_data)
        .ok()
        .and_then(|v| v.get("cniVersion").and_then(|v| v.as_str()).map(String::from))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_ERROR_VERSION.to_string())
}

/// Run one verb against `host`, mapping failures to a CNI error object.
pub fn dispatch(host: &dyn Host, command: &str, args: CmdArgs) -> std::result::Result<(), CniError> {
    let version = payload_version(&args.stdin_data);
    let outcome = match command {
        "ADD" => cmd_add(host, args),
        "DEL" => cmd_del(host, args),
        "CHECK" => cmd_check(host, args),
        other => Err(anyhow::anyhow!("Unknown CNI command: {}", other)),
    };
    outcome.map_err(|err| CniError::from_error(&version, &err))
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> std::result::Result<(), CniError> {
    let fail = |err: anyhow::Error| CniError::from_error(DEFAULT_ERROR_VERSION, &err);

    let command = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")
        .map_err(fail)?;
    if command == "VERSION" {
        println!("{}", version_info());
        return Ok(());
    }

    lock_os_thread().map_err(|e| fail(e.into()))?;
    let args = parse_args(&command).map_err(fail)?;
    let host = SystemHost::new(&PluginConfig::from_env());
    dispatch(&host, &command, args)
}
