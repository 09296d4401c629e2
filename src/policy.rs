//! Layer visibility policies and class modifier flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AnnoError;

/// Visibility region a layer contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Seed,
    Partial,
    Excluded,
    External,
}

impl Policy {
    pub const ALL: [Policy; 4] = [
        Policy::Seed,
        Policy::Partial,
        Policy::Excluded,
        Policy::External,
    ];

    pub const INTERNAL: [Policy; 3] = [Policy::Seed, Policy::Partial, Policy::Excluded];

    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Seed => "seed",
            Policy::Partial => "partial",
            Policy::Excluded => "excluded",
            Policy::External => "external",
        }
    }

    pub fn bit(self) -> PolicySet {
        match self {
            Policy::Seed => PolicySet::SEED,
            Policy::Partial => PolicySet::PARTIAL,
            Policy::Excluded => PolicySet::EXCLUDED,
            Policy::External => PolicySet::EXTERNAL,
        }
    }

    pub fn is_internal(self) -> bool {
        self != Policy::External
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = AnnoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seed" => Ok(Policy::Seed),
            "partial" => Ok(Policy::Partial),
            "excluded" => Ok(Policy::Excluded),
            "external" => Ok(Policy::External),
            other => Err(AnnoError::invalid(format!("unknown policy [ {other} ]"))),
        }
    }
}

bitflags! {
    /// Selection of policies for a query. There is no "null means all":
    /// callers say [`PolicySet::all`] explicitly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PolicySet: u8 {
        const SEED = 0x01;
        const PARTIAL = 0x02;
        const EXCLUDED = 0x04;
        const EXTERNAL = 0x08;

        const INTERNAL = Self::SEED.bits() | Self::PARTIAL.bits() | Self::EXCLUDED.bits();
    }
}

impl PolicySet {
    pub fn accepts(self, policy: Policy) -> bool {
        self.contains(policy.bit())
    }

    pub fn policies(self) -> impl Iterator<Item = Policy> {
        Policy::ALL.into_iter().filter(move |p| self.accepts(*p))
    }

    pub fn touches_external(self) -> bool {
        self.contains(PolicySet::EXTERNAL)
    }
}

impl From<Policy> for PolicySet {
    fn from(policy: Policy) -> Self {
        policy.bit()
    }
}

impl FromStr for PolicySet {
    type Err = AnnoError;

    /// Comma separated policy names, or `all` / `internal`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = PolicySet::empty();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            set |= match part.to_ascii_lowercase().as_str() {
                "all" => PolicySet::all(),
                "internal" => PolicySet::INTERNAL,
                _ => part.parse::<Policy>()?.bit(),
            };
        }
        Ok(set)
    }
}

bitflags! {
    /// JVM access flags as recorded on a class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
    }
}

impl Modifiers {
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}
