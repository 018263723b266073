//! Delegation to an IPAM plugin binary.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

use crate::error::OvsCniError;
use crate::types::{CmdArgs, CniError, Result as CniResult};

/// IPAM verbs the plugin delegates.
pub trait Ipam {
    fn add(&self, plugin: &str, args: &CmdArgs) -> Result<CniResult>;
    fn del(&self, plugin: &str, args: &CmdArgs) -> Result<()>;
    fn check(&self, plugin: &str, args: &CmdArgs) -> Result<()>;
}

/// Runs the IPAM plugin found in `CNI_PATH`.
#[derive(Debug, Clone, Default)]
pub struct ExecIpam;

/// Locate `plugin` in the colon separated `search_path`.
pub fn find_plugin(plugin: &str, search_path: &str) -> Result<PathBuf> {
    if plugin.is_empty() || plugin.contains('/') {
        return Err(OvsCniError::InvalidConfig(format!("invalid IPAM plugin name {:?}", plugin)).into());
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(plugin))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            OvsCniError::Ipam {
                plugin: plugin.to_string(),
                msg: format!("failed to find plugin in path {:?}", search_path),
            }
            .into()
        })
}

/// Failure message from a plugin's output, preferring its CNI error object.
fn failure_message(stdout: &[u8], stderr: &[u8]) -> String {
    match serde_json::from_slice::<CniError>(stdout) {
        Ok(err) if err.details.is_empty() => err.msg,
        Ok(err) => format!("{}; {}", err.msg, err.details),
        Err(_) => {
            let stderr = String::from_utf8_lossy(stderr).trim().to_string();
            if stderr.is_empty() {
                String::from_utf8_lossy(stdout).trim().to_string()
            } else {
                stderr
            }
        }
    }
}

impl ExecIpam {
    pub fn new() -> Self {
        Self
    }

    fn exec(&self, command: &str, plugin: &str, args: &CmdArgs) -> Result<Vec<u8>> {
        let binary = find_plugin(plugin, &args.path)?;
        debug!(plugin, command, binary = %binary.display(), "invoking IPAM plugin");

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &args.container_id)
            .env("CNI_NETNS", &args.netns)
            .env("CNI_IFNAME", &args.ifname)
            .env("CNI_ARGS", args.args_string())
            .env("CNI_PATH", &args.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", binary.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&args.stdin_data)
                .with_context(|| format!("Failed to write config to {}", plugin))?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(OvsCniError::Ipam {
                plugin: plugin.to_string(),
                msg: failure_message(&output.stdout, &output.stderr),
            }
            .into());
        }
        Ok(output.stdout)
    }
}

impl Ipam for ExecIpam {
    fn add(&self, plugin: &str, args: &CmdArgs) -> Result<CniResult> {
        let stdout = self.exec("ADD", plugin, args)?;
        let result: CniResult = serde_json::from_slice(&stdout)
            .with_context(|| format!("failed to parse result of IPAM plugin {}", plugin))?;
        if result.ips().is_empty() {
            return Err(OvsCniError::Ipam {
                plugin: plugin.to_string(),
                msg: "IPAM plugin returned missing IP config".into(),
            }
            .into());
        }
        info!(plugin, ips = result.ips().len(), "IPAM allocated addresses");
        Ok(result)
    }

    fn del(&self, plugin: &str, args: &CmdArgs) -> Result<()> {
        self.exec("DEL", plugin, args)?;
        Ok(())
    }

    fn check(&self, plugin: &str, args: &CmdArgs) -> Result<()> {
        self.exec("CHECK", plugin, args)?;
        Ok(())
    }
}
