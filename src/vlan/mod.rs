//! VLAN tag and trunk computation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::OvsCniError;

/// Highest VLAN id accepted in a trunk specification; the `Port.trunks`
/// column of the OVS schema stops at 4095.
pub const MAX_TRUNK_ID: u32 = 4095;

/// One entry of the `trunk` list: a single id and/or an inclusive range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trunk {
    #[serde(rename = "minID", skip_serializing_if = "Option::is_none")]
    pub min_id: Option<u32>,
    #[serde(rename = "maxID", skip_serializing_if = "Option::is_none")]
    pub max_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl Trunk {
    pub fn single(id: u32) -> Self {
        Self { id: Some(id), ..Self::default() }
    }

    pub fn range(min: u32, max: u32) -> Self {
        Self { min_id: Some(min), max_id: Some(max), id: None }
    }
}

/// Expand trunk entries into a sorted, duplicate-free list of VLAN ids.
///
/// A range only contributes when both bounds are present. An input that
/// produces no ids at all is rejected.
pub fn split_vlan_ids(trunks: &[Trunk]) -> Result<Vec<u16>, OvsCniError> {
    let mut vlans = BTreeSet::new();

    for item in trunks {
        if let Some(min) = item.min_id {
            if min > MAX_TRUNK_ID {
                return Err(OvsCniError::InvalidTrunk("incorrect trunk minID parameter".into()));
            }
        }
        if let Some(max) = item.max_id {
            if max > MAX_TRUNK_ID {
                return Err(OvsCniError::InvalidTrunk("incorrect trunk maxID parameter".into()));
            }
            if max < item.min_id.unwrap_or(0) {
                return Err(OvsCniError::InvalidTrunk(
                    "minID is greater than maxID in trunk parameter".into(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (item.min_id, item.max_id) {
            vlans.extend((min..=max).map(|v| v as u16));
        }
        if let Some(id) = item.id {
            if id > MAX_TRUNK_ID {
                return Err(OvsCniError::InvalidTrunk("incorrect trunk id parameter".into()));
            }
            vlans.insert(id as u16);
        }
    }

    if vlans.is_empty() {
        return Err(OvsCniError::InvalidTrunk("trunk parameter is misconfigured".into()));
    }

    Ok(vlans.into_iter().collect())
}

/// How the switch port handles VLANs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlanPolicy {
    /// Untagged traffic mapped onto a single VLAN.
    Access { tag: u16 },
    /// Tagged traffic restricted to the listed VLANs.
    Trunk { ids: Vec<u16> },
    /// Neither tag nor trunk configured: trunk mode carrying every VLAN.
    Unrestricted,
}

impl VlanPolicy {
    /// Derive the policy from the `vlan` and `trunk` settings of a network.
    pub fn from_conf(vlan: Option<u32>, trunks: &[Trunk]) -> Result<Self, OvsCniError> {
        if !trunks.is_empty() {
            return Ok(Self::Trunk { ids: split_vlan_ids(trunks)? });
        }
        match vlan {
            Some(tag) => {
                let tag = u16::try_from(tag)
                    .ok()
                    .filter(|t| *t <= 4095)
                    .ok_or_else(|| OvsCniError::InvalidConfig(format!("invalid VLAN tag {}", tag)))?;
                Ok(Self::Access { tag })
            }
            None => Ok(Self::Unrestricted),
        }
    }

    /// Value written to the port's `vlan_mode` column.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Access { .. } => "access",
            Self::Trunk { .. } | Self::Unrestricted => "trunk",
        }
    }

    pub fn tag(&self) -> Option<u16> {
        match self {
            Self::Access { tag } => Some(*tag),
            _ => None,
        }
    }

    pub fn trunks(&self) -> &[u16] {
        match self {
            Self::Trunk { ids } => ids,
            _ => &[],
        }
    }
}
