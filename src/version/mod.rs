// src/version/mod.rs

//! Version handling and range satisfaction for bundle dependencies
//!
//! Bundle versions use the four-part major.minor.micro.qualifier scheme.
//! Ranges use interval notation: "[1.0,2.0)" includes 1.0 and excludes 2.0,
//! and a bare version string like "1.0" means "1.0 or anything newer".

use crate::error::{Error, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A parsed bundle version: major.minor.micro with an optional qualifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleVersion {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
    pub qualifier: Option<String>,
}

impl BundleVersion {
    pub const ZERO: BundleVersion = BundleVersion {
        major: 0,
        minor: 0,
        micro: 0,
        qualifier: None,
    };

    pub fn new(major: u64, minor: u64, micro: u64) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: None,
        }
    }

    /// Parse a version string
    ///
    /// Format: major[.minor[.micro[.qualifier]]]
    /// Examples:
    /// - "1" → 1.0.0
    /// - "1.2" → 1.2.0
    /// - "1.2.3" → 1.2.3
    /// - "1.2.3.beta1" → 1.2.3 with qualifier "beta1"
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Version("empty version string".to_string()));
        }

        let mut parts = s.splitn(4, '.');
        let major = Self::numeric_part(s, parts.next())?;
        let minor = match parts.next() {
            Some(p) => Self::numeric_part(s, Some(p))?,
            None => 0,
        };
        let micro = match parts.next() {
            Some(p) => Self::numeric_part(s, Some(p))?,
            None => 0,
        };
        let qualifier = parts.next().map(|q| q.to_string());

        if let Some(ref q) = qualifier
            && !q.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Version(format!("invalid qualifier in '{}'", s)));
        }

        Ok(Self {
            major,
            minor,
            micro,
            qualifier,
        })
    }

    fn numeric_part(full: &str, part: Option<&str>) -> Result<u64> {
        part.ok_or_else(|| Error::Version(format!("incomplete version '{}'", full)))?
            .parse::<u64>()
            .map_err(|e| Error::Version(format!("invalid component in '{}': {}", full, e)))
    }

    /// View the numeric components as a semver triple for comparison
    fn to_semver(&self) -> Version {
        Version::new(self.major, self.minor, self.micro)
    }

    /// Compare two bundle versions
    ///
    /// Numeric components compare numerically; an absent qualifier sorts
    /// before any present qualifier, and present qualifiers compare
    /// lexicographically.
    pub fn compare(&self, other: &BundleVersion) -> Ordering {
        match self.to_semver().cmp(&other.to_semver()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.qualifier.cmp(&other.qualifier)
    }
}

impl fmt::Display for BundleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if let Some(ref q) = self.qualifier {
            write!(f, ".{}", q)?;
        }
        Ok(())
    }
}

impl Ord for BundleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for BundleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A version range over bundle versions
///
/// A missing ceiling means the range is unbounded above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub floor: BundleVersion,
    pub floor_inclusive: bool,
    pub ceiling: Option<BundleVersion>,
    pub ceiling_inclusive: bool,
}

impl VersionRange {
    /// The range that accepts every version
    pub fn any() -> Self {
        Self {
            floor: BundleVersion::ZERO,
            floor_inclusive: true,
            ceiling: None,
            ceiling_inclusive: false,
        }
    }

    /// An exact single-version range
    pub fn exact(version: BundleVersion) -> Self {
        Self {
            floor: version.clone(),
            floor_inclusive: true,
            ceiling: Some(version),
            ceiling_inclusive: true,
        }
    }

    /// Parse a version range string
    ///
    /// Examples:
    /// - "1.0" → at least 1.0, unbounded above
    /// - "[1.0,2.0)" → 1.0 inclusive up to 2.0 exclusive
    /// - "(1.0,2.0]" → above 1.0 up to 2.0 inclusive
    /// - "" → any version
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::any());
        }

        let floor_inclusive = match s.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => {
                // Bare version: floor with open ceiling
                let floor = BundleVersion::parse(s)?;
                return Ok(Self {
                    floor,
                    floor_inclusive: true,
                    ceiling: None,
                    ceiling_inclusive: false,
                });
            }
        };

        let ceiling_inclusive = match s.chars().last() {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(Error::Version(format!("unterminated range '{}'", s))),
        };

        let inner = &s[1..s.len() - 1];
        let (lo, hi) = inner
            .split_once(',')
            .ok_or_else(|| Error::Version(format!("range '{}' needs two endpoints", s)))?;

        Ok(Self {
            floor: BundleVersion::parse(lo)?,
            floor_inclusive,
            ceiling: Some(BundleVersion::parse(hi)?),
            ceiling_inclusive,
        })
    }

    /// Check whether a version falls inside this range
    pub fn includes(&self, version: &BundleVersion) -> bool {
        match version.cmp(&self.floor) {
            Ordering::Less => return false,
            Ordering::Equal if !self.floor_inclusive => return false,
            _ => {}
        }
        if let Some(ref ceiling) = self.ceiling {
            match version.cmp(ceiling) {
                Ordering::Greater => return false,
                Ordering::Equal if !self.ceiling_inclusive => return false,
                _ => {}
            }
        }
        true
    }

    /// True if this range accepts every version
    pub fn is_any(&self) -> bool {
        self.floor == BundleVersion::ZERO && self.floor_inclusive && self.ceiling.is_none()
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ceiling {
            None => write!(f, "{}", self.floor),
            Some(ref ceiling) => write!(
                f,
                "{}{},{}{}",
                if self.floor_inclusive { '[' } else { '(' },
                self.floor,
                ceiling,
                if self.ceiling_inclusive { ']' } else { ')' },
            ),
        }
    }
}
