use tracing::{info, warn};

use crate::integrations::ovsdb::SwitchDb;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Remove ports whose interfaces report an error.
///
/// Nothing here fails the caller: another process may have removed the
/// same port already.
pub fn clean_ports(switch: &dyn SwitchDb, bridge: &str) -> SweepReport {
    let mut report = SweepReport::default();
    let ifaces = match switch.interfaces_in_error() {
        Ok(ifaces) => ifaces,
        Err(err) => {
            warn!("clean ports: {:#}", err);
            return report;
        }
    };

    for iface in ifaces {
        info!("interface {} has error: removing corresponding port", iface);
        match switch.delete_port(bridge, &iface) {
            Ok(()) => report.removed.push(iface),
            Err(err) => {
                warn!("Error: {:#}", err);
                report.failed.push(iface);
            }
        }
    }
    report
}
