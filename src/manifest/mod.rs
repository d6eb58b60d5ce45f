// src/manifest/mod.rs

//! Declared bundle metadata
//!
//! A [`BundleManifest`] is the immutable, self-describing half of a
//! generation: what it offers (exports), what it needs (imports and bundle
//! requirements), and how it behaves (singleton, fragment host descriptor,
//! lazy activation policy). The resolver consumes these declarations; it
//! never reads archive content.
//!
//! Validation happens once, at install/update time. A manifest that fails
//! [`BundleManifest::validate`] is rejected for that attempt only.

use crate::error::{Error, Result};
use crate::version::{BundleVersion, VersionRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;

/// Resolution mode of a package import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ImportMode {
    Mandatory,
    Optional,
    Dynamic,
}

/// Resolution mode of a bundle requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RequireMode {
    Mandatory,
    Optional,
}

/// Visibility of a bundle requirement's packages to the requirer's own
/// dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Visibility {
    Private,
    Reexport,
}

/// Host policy for accepting fragment attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[strum(serialize_all = "lowercase")]
pub enum FragmentAttachment {
    /// Fragments may attach at any time, including after the host resolved
    #[default]
    Always,
    /// Fragments may attach only while the host is not yet resolved
    ResolveTime,
    /// The host accepts no fragments
    Never,
}

/// One exported package declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub package: String,
    pub version: BundleVersion,
    /// Arbitrary matching attributes
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Attribute names an importer must explicitly match
    #[serde(default)]
    pub mandatory: Vec<String>,
    /// Packages this export's implementation depends on, for the
    /// uses-consistency check
    #[serde(default)]
    pub uses: Vec<String>,
    /// Version string the builder could not parse; reported by
    /// [`BundleManifest::validate`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid: Option<String>,
}

impl ExportSpec {
    pub fn new(package: impl Into<String>, version: &str) -> Self {
        let package = package.into();
        let (version, invalid) = match BundleVersion::parse(version) {
            Ok(v) => (v, None),
            Err(err) => (BundleVersion::ZERO, Some(format!("export {}: {}", package, err))),
        };
        Self {
            package,
            version,
            attributes: BTreeMap::new(),
            mandatory: Vec::new(),
            uses: Vec::new(),
            invalid,
        }
    }

    pub fn with_uses(mut self, uses: &[&str]) -> Self {
        self.uses = uses.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_mandatory(mut self, names: &[&str]) -> Self {
        self.mandatory = names.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// One imported package declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSpec {
    pub package: String,
    #[serde(default)]
    pub version_range: VersionRange,
    /// Constrain the provider to a specific bundle
    #[serde(default)]
    pub bundle_symbolic_name: Option<String>,
    #[serde(default)]
    pub bundle_version_range: Option<VersionRange>,
    /// Attribute values the chosen export must carry
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub mode: ImportMode,
    /// Range string the builder could not parse; reported by
    /// [`BundleManifest::validate`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid: Option<String>,
}

impl ImportSpec {
    pub fn new(package: impl Into<String>, range: &str) -> Self {
        let package = package.into();
        let (version_range, invalid) = match VersionRange::parse(range) {
            Ok(r) => (r, None),
            Err(err) => (
                VersionRange::default(),
                Some(format!("import {}: {}", package, err)),
            ),
        };
        Self {
            package,
            version_range,
            bundle_symbolic_name: None,
            bundle_version_range: None,
            attributes: BTreeMap::new(),
            mode: ImportMode::Mandatory,
            invalid,
        }
    }

    pub fn optional(mut self) -> Self {
        self.mode = ImportMode::Optional;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.mode = ImportMode::Dynamic;
        self
    }

    pub fn from_bundle(mut self, symbolic_name: impl Into<String>) -> Self {
        self.bundle_symbolic_name = Some(symbolic_name.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A Require-Bundle declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequireSpec {
    pub symbolic_name: String,
    #[serde(default)]
    pub version_range: VersionRange,
    pub mode: RequireMode,
    pub visibility: Visibility,
    /// Range string the builder could not parse; reported by
    /// [`BundleManifest::validate`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid: Option<String>,
}

impl RequireSpec {
    pub fn new(symbolic_name: impl Into<String>, range: &str) -> Self {
        let symbolic_name = symbolic_name.into();
        let (version_range, invalid) = match VersionRange::parse(range) {
            Ok(r) => (r, None),
            Err(err) => (
                VersionRange::default(),
                Some(format!("require {}: {}", symbolic_name, err)),
            ),
        };
        Self {
            symbolic_name,
            version_range,
            mode: RequireMode::Mandatory,
            visibility: Visibility::Private,
            invalid,
        }
    }

    pub fn optional(mut self) -> Self {
        self.mode = RequireMode::Optional;
        self
    }

    pub fn reexport(mut self) -> Self {
        self.visibility = Visibility::Reexport;
        self
    }
}

/// Fragment-host descriptor: present iff the declaring bundle is a fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub symbolic_name: String,
    #[serde(default)]
    pub version_range: VersionRange,
}

/// Lazy activation policy: activation is deferred until a triggering
/// package passing the include/exclude filter is first touched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyActivation {
    /// Packages that trigger activation; empty means all
    #[serde(default)]
    pub include: Vec<String>,
    /// Packages that never trigger activation
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl LazyActivation {
    /// Does a touch of `package` trigger activation under this policy?
    pub fn triggers(&self, package: &str) -> bool {
        if self.exclude.iter().any(|p| p == package) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p == package)
    }
}

/// Immutable declared metadata for one bundle generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// May be absent for legacy bundles; such bundles cannot be required
    /// and cannot be singletons
    pub symbolic_name: Option<String>,
    pub version: BundleVersion,
    #[serde(default)]
    pub singleton: bool,
    #[serde(default)]
    pub fragment_attachment: FragmentAttachment,
    #[serde(default)]
    pub lazy_activation: Option<LazyActivation>,
    /// Present iff this bundle is a fragment
    #[serde(default)]
    pub fragment_host: Option<HostSpec>,
    /// Whether the bundle declares an entry point
    #[serde(default)]
    pub has_activator: bool,
    #[serde(default)]
    pub exports: Vec<ExportSpec>,
    #[serde(default)]
    pub imports: Vec<ImportSpec>,
    #[serde(default)]
    pub requires: Vec<RequireSpec>,
}

impl BundleManifest {
    pub fn named(symbolic_name: impl Into<String>, version: &str) -> Result<Self> {
        Ok(Self {
            symbolic_name: Some(symbolic_name.into()),
            version: BundleVersion::parse(version)?,
            singleton: false,
            fragment_attachment: FragmentAttachment::default(),
            lazy_activation: None,
            fragment_host: None,
            has_activator: false,
            exports: Vec::new(),
            imports: Vec::new(),
            requires: Vec::new(),
        })
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn with_activator(mut self) -> Self {
        self.has_activator = true;
        self
    }

    pub fn with_lazy_activation(mut self, policy: LazyActivation) -> Self {
        self.lazy_activation = Some(policy);
        self
    }

    pub fn fragment_of(mut self, symbolic_name: impl Into<String>, range: &str) -> Result<Self> {
        self.fragment_host = Some(HostSpec {
            symbolic_name: symbolic_name.into(),
            version_range: VersionRange::parse(range)?,
        });
        Ok(self)
    }

    pub fn export(mut self, spec: ExportSpec) -> Self {
        self.exports.push(spec);
        self
    }

    pub fn import(mut self, spec: ImportSpec) -> Self {
        self.imports.push(spec);
        self
    }

    pub fn require(mut self, spec: RequireSpec) -> Self {
        self.requires.push(spec);
        self
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }

    /// Check declaration consistency. Called once per install/update
    /// attempt; a failure rejects that attempt only.
    pub fn validate(&self) -> Result<()> {
        let malformed = self
            .exports
            .iter()
            .filter_map(|e| e.invalid.as_deref())
            .chain(self.imports.iter().filter_map(|i| i.invalid.as_deref()))
            .chain(self.requires.iter().filter_map(|r| r.invalid.as_deref()))
            .next();
        if let Some(detail) = malformed {
            return Err(Error::Manifest(format!("malformed version in {}", detail)));
        }

        if self.singleton && self.symbolic_name.is_none() {
            return Err(Error::Manifest(
                "singleton directive requires a symbolic name".to_string(),
            ));
        }

        if self.is_fragment() && self.has_activator {
            return Err(Error::Manifest(
                "a fragment cannot declare an activator".to_string(),
            ));
        }

        if let Some(ref lazy) = self.lazy_activation {
            for pkg in &lazy.include {
                if lazy.exclude.contains(pkg) {
                    return Err(Error::Manifest(format!(
                        "package {} appears in both lazy-activation include and exclude",
                        pkg
                    )));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for import in &self.imports {
            if !seen.insert(&import.package) {
                return Err(Error::Manifest(format!(
                    "duplicate import declaration for package {}",
                    import.package
                )));
            }
        }

        Ok(())
    }
}
