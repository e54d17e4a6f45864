//! Address and MTU planning for text-driven transports

use crate::error::WgctlResult;
use crate::validation::normalize_cidr;

/// An address observed on the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    /// CIDR with host bits, e.g. `10.0.0.1/24`
    pub address: String,
    /// Assigned by SLAAC, DHCP or similar
    pub dynamic: bool,
    pub link_scope: bool,
}

impl AddressEntry {
    pub fn new(address: impl Into<String>) -> Self {
        AddressEntry {
            address: address.into(),
            dynamic: false,
            link_scope: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPlan {
    /// Desired address to add, host bits kept
    pub add: Option<String>,
    /// Observed addresses to delete, as observed
    pub remove: Vec<String>,
}

impl AddressPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_none() && self.remove.is_empty()
    }
}

/// Compare on the masked form so `10.0.0.1/24` and `10.0.0.0/24` count as equal
pub fn plan_addresses(current: &[AddressEntry], desired: &str) -> WgctlResult<AddressPlan> {
    let wanted = normalize_cidr(desired)?;
    let mut plan = AddressPlan::default();
    let mut present = false;

    for entry in current {
        if entry.dynamic || entry.link_scope {
            continue;
        }
        let Ok(normalized) = normalize_cidr(&entry.address) else {
            continue;
        };
        if normalized == wanted {
            present = true;
        } else {
            plan.remove.push(entry.address.clone());
        }
    }

    if !present {
        plan.add = Some(desired.trim().to_string());
    }
    Ok(plan)
}

/// MTU to set, if any; `0` means leave it alone
pub fn plan_mtu(current: u32, desired: u32) -> Option<u32> {
    (desired > 0 && desired != current).then_some(desired)
}
