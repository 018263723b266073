use anyhow::Result;
use tracing::debug;

use crate::error::OvsCniError;
use crate::integrations::ovsdb::SwitchDb;
use crate::integrations::sriov::Offload;

/// Integration bridge used by OVN-managed ports.
pub const OVN_INTEGRATION_BRIDGE: &str = "br-int";

/// Pick the bridge an interface belongs on.
///
/// Explicit name first, then the OVN integration bridge, then the bridge
/// owning one of the VF's uplinks.
pub fn resolve_bridge(
    bridge: &str,
    ovn_port: Option<&str>,
    device_id: &str,
    switch: &dyn SwitchDb,
    offload: &dyn Offload,
) -> Result<String> {
    if !bridge.is_empty() {
        return Ok(bridge.to_string());
    }
    if ovn_port.is_some_and(|p| !p.is_empty()) {
        return Ok(OVN_INTEGRATION_BRIDGE.to_string());
    }
    if device_id.is_empty() {
        return Err(OvsCniError::BridgeNotResolved.into());
    }

    let uplinks = offload.uplink_candidates(device_id)?;
    let mut errors = Vec::new();
    for uplink in &uplinks {
        match switch.bridge_for_interface(uplink) {
            Ok(name) => {
                debug!(device_id, uplink = %uplink, bridge = %name, "bridge found by uplink");
                return Ok(name);
            }
            Err(err) => errors.push(format!("{:#}", err)),
        }
    }

    Err(OvsCniError::BridgeLookup {
        uplinks: uplinks.join(", "),
        errors: errors.join(", "),
    }
    .into())
}
