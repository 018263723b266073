use std::fmt::Display;

use thiserror::Error;
use tracing::warn;

/// CNI error code for an unknown container or namespace.
pub const CODE_UNKNOWN_CONTAINER: u32 = 3;
/// CNI error code for an invalid network configuration.
pub const CODE_INVALID_CONFIG: u32 = 7;
/// First CNI error code reserved for plugin-specific failures.
pub const CODE_PLUGIN: u32 = 100;

/// Failures the attach/detach/verify logic needs to tell apart.
///
/// These travel inside `anyhow::Error`; callers that branch on them use
/// `downcast_ref::<OvsCniError>()`.
#[derive(Error, Debug)]
pub enum OvsCniError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    InvalidTrunk(String),

    #[error("failed to get bridge name")]
    BridgeNotResolved,

    #[error("failed to find bridge by uplink names [{uplinks}]: [{errors}]")]
    BridgeLookup { uplinks: String, errors: String },

    // ========================================================================
    // Kernel Errors
    // ========================================================================
    #[error("network namespace {0} does not exist")]
    NetnsNotFound(String),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("namespace operations are pinned to another thread")]
    ThreadNotPinned,

    // ========================================================================
    // Switch Errors
    // ========================================================================
    #[error("OVSDB error: {0}")]
    Ovsdb(String),

    #[error("The OF port {0} state is not up, try increasing number of retries/interval config parameter")]
    PortNotUp(String),

    // ========================================================================
    // IPAM Errors
    // ========================================================================
    #[error("IPAM plugin {plugin}: {msg}")]
    Ipam { plugin: String, msg: String },

    // ========================================================================
    // Cache / Verification Errors
    // ========================================================================
    #[error("no cached attachment found for {0}")]
    CacheMissing(String),

    #[error("{field} mismatch. cache={cached},netconf={current}")]
    CacheMismatch {
        field: &'static str,
        cached: String,
        current: String,
    },

    #[error("{0}")]
    VlanMismatch(String),

    #[error("{0}")]
    Verification(String),
}

impl OvsCniError {
    /// CNI error code reported to the runtime for this failure.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidConfig(_)
            | Self::InvalidTrunk(_)
            | Self::BridgeNotResolved
            | Self::BridgeLookup { .. } => CODE_INVALID_CONFIG,
            Self::NetnsNotFound(_) => CODE_UNKNOWN_CONTAINER,
            _ => CODE_PLUGIN,
        }
    }

    /// Map an arbitrary error chain to a CNI error code.
    pub fn code_of(err: &anyhow::Error) -> u32 {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<OvsCniError>())
            .map(OvsCniError::code)
            .unwrap_or(CODE_PLUGIN)
    }

    /// True when `err` says the namespace or the link is already gone.
    pub fn is_already_gone(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<OvsCniError>(),
                Some(OvsCniError::NetnsNotFound(_)) | Some(OvsCniError::LinkNotFound(_))
            )
        })
    }
}

/// Run the result of an opportunistic step through the warning log.
///
/// The failure is never propagated; `None` means the step did not happen.
pub fn best_effort<T, E: Display>(what: impl Display, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Failed best-effort {}: {:#}", what, err);
            None
        }
    }
}
