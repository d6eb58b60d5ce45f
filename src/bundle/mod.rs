// src/bundle/mod.rs

//! Bundles and their generations
//!
//! A [`Bundle`] is the identity that survives updates: numeric id, install
//! location, pointer to the current generation. A [`BundleGeneration`] is
//! one revision of its content. Generations, not bundles, are what the
//! resolver operates on.
//!
//! Generations live in an append-only arena ([`Generations`]) and refer to
//! each other by integer id. Provider fields on imports and requirements
//! are [`ExportId`]/[`GenerationId`] values, never references, which keeps
//! zombie lifetime reasoning simple: a superseded generation stays in the
//! arena until the last wire pointing at it is torn down.

use crate::lifecycle::{BundleState, Operation};
use crate::manifest::{BundleManifest, ExportSpec, ImportSpec, RequireSpec};
use crate::version::BundleVersion;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persistent bundle identity, stable across updates
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BundleId(pub u64);

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Arena index of one generation. Never reused within a runtime's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(pub u32);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Identifies one export declaration inside a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExportId {
    pub generation: GenerationId,
    pub index: u32,
}

/// Identifies one import declaration inside a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportId {
    pub generation: GenerationId,
    pub index: u32,
}

/// A generation's offer to provide a package
#[derive(Debug, Clone)]
pub struct ExportPkg {
    pub spec: ExportSpec,
    /// Set once the owning generation has been superseded while other
    /// resolved code still wires to this export
    pub zombie: bool,
    /// Which attached fragment contributed this declaration, if any
    pub from_fragment: Option<GenerationId>,
}

impl ExportPkg {
    fn declared(spec: ExportSpec) -> Self {
        Self {
            spec,
            zombie: false,
            from_fragment: None,
        }
    }
}

/// A generation's need for a package
#[derive(Debug, Clone)]
pub struct ImportPkg {
    pub spec: ImportSpec,
    /// The chosen provider once a resolution transaction has committed
    pub provider: Option<ExportId>,
    /// First-bind-wins ordering among dynamic imports of one generation
    pub dynamic_ordinal: Option<u64>,
    pub from_fragment: Option<GenerationId>,
}

impl ImportPkg {
    fn declared(spec: ImportSpec) -> Self {
        Self {
            spec,
            provider: None,
            dynamic_ordinal: None,
            from_fragment: None,
        }
    }
}

/// A generation's dependency on another bundle by symbolic name
#[derive(Debug, Clone)]
pub struct RequireBundle {
    pub spec: RequireSpec,
    /// The provider generation once resolved
    pub provider: Option<GenerationId>,
    pub from_fragment: Option<GenerationId>,
}

impl RequireBundle {
    fn declared(spec: RequireSpec) -> Self {
        Self {
            spec,
            provider: None,
            from_fragment: None,
        }
    }
}

/// One versioned revision of a bundle's content
///
/// Declared metadata is immutable; resolution state (fragments, wiring,
/// flags) mutates only under the runtime's resolution lock. A generation
/// is resolved at most once: re-resolution after a fragment detach is a new
/// attempt on an unresolved generation, never a mutation of a live wire.
#[derive(Debug)]
pub struct BundleGeneration {
    pub id: GenerationId,
    pub bundle_id: BundleId,
    /// Generation counter within the owning bundle, starting at 1
    pub number: u32,
    pub manifest: BundleManifest,
    pub exports: Vec<ExportPkg>,
    pub imports: Vec<ImportPkg>,
    pub requires: Vec<RequireBundle>,
    /// Attached fragment generations, ordered by bundle id
    pub fragments: Vec<GenerationId>,
    /// For a fragment: the host it is attached to
    pub host: Option<GenerationId>,
    pub resolved: bool,
    /// The owning bundle has been uninstalled; the generation survives only
    /// as a zombie
    pub uninstalled: bool,
    /// Generations holding a Require-Bundle wire to this one
    pub required_by: Vec<GenerationId>,
    /// Exports made visible through reexport-visibility requirements,
    /// filled at commit
    pub reexports: Vec<ExportId>,
    /// Opaque handle the external code loader associates with this
    /// generation once resolved
    pub loader_handle: Option<u64>,
    pub next_dynamic_ordinal: u64,
}

impl BundleGeneration {
    fn new(id: GenerationId, bundle_id: BundleId, number: u32, manifest: BundleManifest) -> Self {
        let exports = manifest.exports.iter().cloned().map(ExportPkg::declared).collect();
        let imports = manifest.imports.iter().cloned().map(ImportPkg::declared).collect();
        let requires = manifest.requires.iter().cloned().map(RequireBundle::declared).collect();
        Self {
            id,
            bundle_id,
            number,
            manifest,
            exports,
            imports,
            requires,
            fragments: Vec::new(),
            host: None,
            resolved: false,
            uninstalled: false,
            required_by: Vec::new(),
            reexports: Vec::new(),
            loader_handle: None,
            next_dynamic_ordinal: 0,
        }
    }

    pub fn symbolic_name(&self) -> Option<&str> {
        self.manifest.symbolic_name.as_deref()
    }

    pub fn version(&self) -> &BundleVersion {
        &self.manifest.version
    }

    pub fn is_fragment(&self) -> bool {
        self.manifest.is_fragment()
    }

    /// "sym:1.0.0" for diagnostics, falling back to the generation id
    pub fn display_name(&self) -> String {
        match self.symbolic_name() {
            Some(name) => format!("{}:{}", name, self.version()),
            None => self.id.to_string(),
        }
    }

    /// True if any export of this generation has been marked zombie
    pub fn has_zombie_exports(&self) -> bool {
        self.exports.iter().any(|e| e.zombie)
    }

    /// Clear all resolution state, returning the generation to its
    /// freshly-declared shape. Wires into this generation must already be
    /// gone; the caller owns that invariant.
    pub fn unresolve(&mut self) {
        self.resolved = false;
        self.loader_handle = None;
        self.reexports.clear();
        self.required_by.clear();
        for import in &mut self.imports {
            import.provider = None;
            import.dynamic_ordinal = None;
        }
        for require in &mut self.requires {
            require.provider = None;
        }
        self.next_dynamic_ordinal = 0;
    }
}

/// Append-only arena of generations
///
/// Slots are tombstoned on purge rather than reused, so a stale
/// `GenerationId` can never alias a newer generation.
#[derive(Debug, Default)]
pub struct Generations {
    slots: Vec<Option<BundleGeneration>>,
    next_loader: u64,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        bundle_id: BundleId,
        number: u32,
        manifest: BundleManifest,
    ) -> GenerationId {
        let id = GenerationId(self.slots.len() as u32);
        self.slots
            .push(Some(BundleGeneration::new(id, bundle_id, number, manifest)));
        id
    }

    pub fn get(&self, id: GenerationId) -> &BundleGeneration {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("generation purged while still referenced")
    }

    pub fn get_mut(&mut self, id: GenerationId) -> &mut BundleGeneration {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("generation purged while still referenced")
    }

    pub fn contains(&self, id: GenerationId) -> bool {
        self.slots
            .get(id.0 as usize)
            .is_some_and(|slot| slot.is_some())
    }

    /// Release a generation's slot. Only legal once no wire references it.
    pub fn purge(&mut self, id: GenerationId) -> BundleGeneration {
        self.slots[id.0 as usize]
            .take()
            .expect("generation purged twice")
    }

    pub fn export(&self, id: ExportId) -> &ExportPkg {
        &self.get(id.generation).exports[id.index as usize]
    }

    pub fn export_mut(&mut self, id: ExportId) -> &mut ExportPkg {
        &mut self.get_mut(id.generation).exports[id.index as usize]
    }

    pub fn import(&self, id: ImportId) -> &ImportPkg {
        &self.get(id.generation).imports[id.index as usize]
    }

    pub fn import_mut(&mut self, id: ImportId) -> &mut ImportPkg {
        &mut self.get_mut(id.generation).imports[id.index as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &BundleGeneration> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// Live generations carrying a symbolic name, in insertion order
    pub fn find_symbolic(&self, symbolic_name: &str) -> Vec<GenerationId> {
        self.iter()
            .filter(|g| g.symbolic_name() == Some(symbolic_name))
            .map(|g| g.id)
            .collect()
    }

    /// Contribute a fragment's declarations to its host
    ///
    /// Host ordering among fragments follows bundle id. The host must not
    /// be resolved; the lifecycle layer enforces the attach policy before
    /// calling here.
    pub fn attach_fragment(&mut self, host_id: GenerationId, fragment_id: GenerationId) {
        let fragment_bundle = self.get(fragment_id).bundle_id;
        let manifest = self.get(fragment_id).manifest.clone();
        let attached_bundles: Vec<BundleId> = self
            .get(host_id)
            .fragments
            .iter()
            .map(|&f| self.get(f).bundle_id)
            .collect();

        let host = self.get_mut(host_id);
        let insert_at = attached_bundles
            .iter()
            .position(|&b| b > fragment_bundle)
            .unwrap_or(host.fragments.len());
        host.fragments.insert(insert_at, fragment_id);

        for spec in manifest.exports {
            host.exports.push(ExportPkg {
                spec,
                zombie: false,
                from_fragment: Some(fragment_id),
            });
        }
        for spec in manifest.imports {
            host.imports.push(ImportPkg {
                spec,
                provider: None,
                dynamic_ordinal: None,
                from_fragment: Some(fragment_id),
            });
        }
        for spec in manifest.requires {
            host.requires.push(RequireBundle {
                spec,
                provider: None,
                from_fragment: Some(fragment_id),
            });
        }

        self.get_mut(fragment_id).host = Some(host_id);
        tracing::debug!(
            fragment = %fragment_bundle,
            host = %host_id,
            "fragment attached"
        );
    }

    /// Hand a freshly-resolved generation its loader handle. Handles are
    /// unique per runtime and never recycled.
    pub fn assign_loader(&mut self, id: GenerationId) {
        let handle = self.next_loader;
        self.next_loader += 1;
        self.get_mut(id).loader_handle = Some(handle);
    }

    /// Remove a fragment's contribution from its host
    pub fn detach_fragment(&mut self, host_id: GenerationId, fragment_id: GenerationId) {
        let host = self.get_mut(host_id);
        host.fragments.retain(|&f| f != fragment_id);
        host.exports.retain(|e| e.from_fragment != Some(fragment_id));
        host.imports.retain(|i| i.from_fragment != Some(fragment_id));
        host.requires.retain(|r| r.from_fragment != Some(fragment_id));
        self.get_mut(fragment_id).host = None;
    }
}

/// A deployable unit with identity that survives updates
#[derive(Debug)]
pub struct Bundle {
    pub id: BundleId,
    pub location: String,
    pub current: GenerationId,
    /// Superseded generations whose exports are still wired elsewhere
    pub retired: Vec<GenerationId>,
    pub state: BundleState,
    /// Advisory guard for in-flight lifecycle transitions
    pub operation: Operation,
    /// Last resolution failure, replayed to callers until the graph changes
    pub failure: Option<(u64, String)>,
    /// How many generations this bundle has had, including the current one
    pub generation_count: u32,
}

impl Bundle {
    pub fn new(id: BundleId, location: String, current: GenerationId) -> Self {
        Self {
            id,
            location,
            current,
            retired: Vec::new(),
            state: BundleState::Installed,
            operation: Operation::Idle,
            failure: None,
            generation_count: 1,
        }
    }
}
