use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Top-level workflows. Only one may be active at a time.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    HostPrep,
    VmCreate,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::HostPrep, Phase::VmCreate];

    /// Return the stable string identifier used in JSON artifacts and on the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::HostPrep => "host-prep",
            Phase::VmCreate => "vm-create",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Phase::HostPrep => "install virtualization packages and enable IOMMU",
            Phase::VmCreate => "create the Windows VM and wire up passthrough",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == value)
            .ok_or_else(|| {
                format!("unknown phase `{value}` (expected one of: host-prep, vm-create)")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_parse_back() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>(), Ok(phase));
        }
        assert!("host_prep".parse::<Phase>().is_err());
    }

    #[test]
    fn phase_serializes_as_kebab_case() {
        let json = serde_json::to_string(&Phase::VmCreate).expect("serialize phase");
        assert_eq!(json, "\"vm-create\"");
    }
}
