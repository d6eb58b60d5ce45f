// src/graph/mod.rs

//! The global package graph
//!
//! Maps each package name to its exporter declarations, the subset of
//! exporters actually selected by a committed resolution, and its importer
//! declarations. The resolver reads candidates from here and writes
//! selections back only through a transaction commit; the lifecycle layer
//! registers declarations at install time and unregisters them at
//! update/uninstall time.
//!
//! Exporters are kept in declaration (registration) order and tried in that
//! order. There is no implicit highest-version-wins rule: range filtering
//! and the uses-consistency check decide, and an already-selected provider
//! is preferred over deriving a new one.

use crate::bundle::{BundleId, ExportId, GenerationId, Generations, ImportId};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// One package name and everything declared against it
#[derive(Debug, Default)]
pub struct Pkg {
    /// Exporter declarations in registration order
    pub exporters: Vec<ExportId>,
    /// Exporters chosen by some committed resolution
    pub selected: Vec<ExportId>,
    /// Importer declarations, resolved or not
    pub importers: Vec<ImportId>,
}

/// Global mapping from package name to its exporters and importers
#[derive(Debug, Default)]
pub struct PackageGraph {
    packages: HashMap<String, Pkg>,
}

impl PackageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generation's export and import declarations
    ///
    /// Idempotent: re-registering an already-present declaration is a
    /// no-op. Creates the `Pkg` entry on first reference to a name. Side
    /// effect only; never selects providers.
    pub fn register(&mut self, store: &Generations, generation: GenerationId) {
        let entry = store.get(generation);
        for (index, export) in entry.exports.iter().enumerate() {
            let id = ExportId {
                generation,
                index: index as u32,
            };
            let pkg = self.packages.entry(export.spec.package.clone()).or_default();
            if !pkg.exporters.contains(&id) {
                pkg.exporters.push(id);
            }
        }
        for (index, import) in entry.imports.iter().enumerate() {
            let id = ImportId {
                generation,
                index: index as u32,
            };
            let pkg = self.packages.entry(import.spec.package.clone()).or_default();
            if !pkg.importers.contains(&id) {
                pkg.importers.push(id);
            }
        }
    }

    /// Remove a generation's declarations
    ///
    /// Returns false without mutating anything when `force` is unset and
    /// other code still depends on one of the generation's exports: either
    /// a Require-Bundle wire from a different generation, or a selected
    /// import provider belonging to a different generation. A caller that
    /// gets false must mark the exports zombie and retain the generation.
    pub fn unregister(
        &mut self,
        store: &Generations,
        generation: GenerationId,
        force: bool,
    ) -> bool {
        if !force && self.depended_on(store, generation) {
            return false;
        }

        let entry = store.get(generation);
        for export in &entry.exports {
            if let Some(pkg) = self.packages.get_mut(&export.spec.package) {
                pkg.exporters.retain(|e| e.generation != generation);
                pkg.selected.retain(|e| e.generation != generation);
            }
        }
        for import in &entry.imports {
            if let Some(pkg) = self.packages.get_mut(&import.spec.package) {
                pkg.importers.retain(|i| i.generation != generation);
            }
        }
        self.packages
            .retain(|_, pkg| !(pkg.exporters.is_empty() && pkg.importers.is_empty()));
        debug!(generation = %generation, "declarations unregistered");
        true
    }

    /// Rebuild a generation's entries after its declaration list changed
    /// shape, as a fragment attach or detach does
    ///
    /// Drops every entry carrying the generation's id, then registers the
    /// current declarations. Only meaningful for unresolved generations;
    /// resolved wires are never resynced.
    pub fn resync(&mut self, store: &Generations, generation: GenerationId) {
        for pkg in self.packages.values_mut() {
            pkg.exporters.retain(|e| e.generation != generation);
            pkg.selected.retain(|e| e.generation != generation);
            pkg.importers.retain(|i| i.generation != generation);
        }
        self.packages
            .retain(|_, pkg| !(pkg.exporters.is_empty() && pkg.importers.is_empty()));
        if store.contains(generation) {
            self.register(store, generation);
        }
    }

    /// Does any other resolved generation hold a wire into this one?
    fn depended_on(&self, store: &Generations, generation: GenerationId) -> bool {
        // Require-Bundle wires carry a back-reference on the provider
        if store
            .get(generation)
            .required_by
            .iter()
            .any(|&r| r != generation && store.contains(r))
        {
            return true;
        }

        for (index, export) in store.get(generation).exports.iter().enumerate() {
            let export_id = ExportId {
                generation,
                index: index as u32,
            };
            let Some(pkg) = self.packages.get(&export.spec.package) else {
                continue;
            };
            for &importer in &pkg.importers {
                if importer.generation == generation {
                    continue;
                }
                if store.import(importer).provider == Some(export_id) {
                    return true;
                }
            }
        }
        false
    }

    /// Exporter declarations for a package, in declaration order
    pub fn exporters(&self, package: &str) -> &[ExportId] {
        self.packages
            .get(package)
            .map(|p| p.exporters.as_slice())
            .unwrap_or(&[])
    }

    /// Currently selected providers for a package
    pub fn selected(&self, package: &str) -> &[ExportId] {
        self.packages
            .get(package)
            .map(|p| p.selected.as_slice())
            .unwrap_or(&[])
    }

    /// Importer declarations for a package
    pub fn importers(&self, package: &str) -> &[ImportId] {
        self.packages
            .get(package)
            .map(|p| p.importers.as_slice())
            .unwrap_or(&[])
    }

    /// Record an exporter as a selected provider. Only the resolver's
    /// commit step calls this.
    pub fn select(&mut self, package: &str, export: ExportId) {
        let pkg = self.packages.entry(package.to_string()).or_default();
        if !pkg.selected.contains(&export) {
            pkg.selected.push(export);
        }
    }

    /// Transitive closure of bundles whose resolved state is invalidated if
    /// the given generations go away
    ///
    /// Starts from an explicit seed set, or from every bundle exporting a
    /// zombie package when the seed is empty, and repeatedly adds any
    /// bundle that imports a package from, or requires, a bundle already in
    /// the set. The result is what an external refresh must move back to
    /// INSTALLED before zombies can be purged.
    pub fn zombie_affected(&self, store: &Generations, seed: &[BundleId]) -> Vec<BundleId> {
        let mut affected: HashSet<BundleId> = if seed.is_empty() {
            store
                .iter()
                .filter(|g| g.has_zombie_exports())
                .map(|g| g.bundle_id)
                .collect()
        } else {
            seed.iter().copied().collect()
        };

        let mut queue: VecDeque<BundleId> = affected.iter().copied().collect();
        while let Some(bundle) = queue.pop_front() {
            for generation in store.iter().filter(|g| g.resolved) {
                if affected.contains(&generation.bundle_id) {
                    continue;
                }
                let imports_from = generation.imports.iter().any(|i| {
                    i.provider
                        .is_some_and(|p| store.get(p.generation).bundle_id == bundle)
                });
                let requires = generation.requires.iter().any(|r| {
                    r.provider.is_some_and(|p| store.get(p).bundle_id == bundle)
                });
                let hosted_by = generation
                    .host
                    .is_some_and(|h| store.get(h).bundle_id == bundle);
                let hosts = generation
                    .fragments
                    .iter()
                    .any(|&f| store.get(f).bundle_id == bundle);
                if imports_from || requires || hosted_by || hosts {
                    affected.insert(generation.bundle_id);
                    queue.push_back(generation.bundle_id);
                }
            }
        }

        let mut result: Vec<BundleId> = affected.into_iter().collect();
        result.sort();
        result
    }

    /// Number of distinct package names known to the graph
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{BundleManifest, ExportSpec, ImportSpec};

    fn exporter(store: &mut Generations, bundle: u64, name: &str, pkg: &str) -> GenerationId {
        let m = BundleManifest::named(name, "1.0.0")
            .unwrap()
            .export(ExportSpec::new(pkg, "1.0.0"));
        store.insert(BundleId(bundle), 1, m)
    }

    fn importer(store: &mut Generations, bundle: u64, name: &str, pkg: &str) -> GenerationId {
        let m = BundleManifest::named(name, "1.0.0")
            .unwrap()
            .import(ImportSpec::new(pkg, ""));
        store.insert(BundleId(bundle), 1, m)
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut store = Generations::new();
        let mut graph = PackageGraph::new();
        let a = exporter(&mut store, 1, "a", "p");

        graph.register(&store, a);
        graph.register(&store, a);
        assert_eq!(graph.exporters("p").len(), 1);
    }

    #[test]
    fn test_register_creates_pkg_on_first_reference() {
        let mut store = Generations::new();
        let mut graph = PackageGraph::new();
        let b = importer(&mut store, 1, "b", "p");

        assert!(graph.exporters("p").is_empty());
        graph.register(&store, b);
        assert_eq!(graph.importers("p").len(), 1);
        assert!(graph.selected("p").is_empty());
    }

    #[test]
    fn test_unregister_free_generation() {
        let mut store = Generations::new();
        let mut graph = PackageGraph::new();
        let a = exporter(&mut store, 1, "a", "p");
        graph.register(&store, a);

        assert!(graph.unregister(&store, a, false));
        assert!(graph.exporters("p").is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_unregister_vetoed_by_import_wire() {
        let mut store = Generations::new();
        let mut graph = PackageGraph::new();
        let a = exporter(&mut store, 1, "a", "p");
        let b = importer(&mut store, 2, "b", "p");
        graph.register(&store, a);
        graph.register(&store, b);

        // Wire b's import to a's export, as a committed resolution would
        let export = ExportId {
            generation: a,
            index: 0,
        };
        store.get_mut(b).imports[0].provider = Some(export);
        store.get_mut(b).resolved = true;
        graph.select("p", export);

        assert!(!graph.unregister(&store, a, false));
        // Vetoed call must not have mutated anything
        assert_eq!(graph.exporters("p").len(), 1);
        assert_eq!(graph.selected("p").len(), 1);

        assert!(graph.unregister(&store, a, true));
        assert!(graph.exporters("p").is_empty());
    }

    #[test]
    fn test_unregister_vetoed_by_require_wire() {
        let mut store = Generations::new();
        let mut graph = PackageGraph::new();
        let a = exporter(&mut store, 1, "a", "p");
        let b = importer(&mut store, 2, "b", "q");
        graph.register(&store, a);

        store.get_mut(a).required_by.push(b);
        assert!(!graph.unregister(&store, a, false));
    }

    #[test]
    fn test_zombie_affected_closure() {
        let mut store = Generations::new();
        let mut graph = PackageGraph::new();

        // a exports p (zombie); b imports p; c imports q from b
        let a = exporter(&mut store, 1, "a", "p");
        let b = store.insert(
            BundleId(2),
            1,
            BundleManifest::named("b", "1.0.0")
                .unwrap()
                .import(ImportSpec::new("p", ""))
                .export(ExportSpec::new("q", "1.0.0")),
        );
        let c = importer(&mut store, 3, "c", "q");
        for g in [a, b, c] {
            graph.register(&store, g);
        }

        store.get_mut(a).exports[0].zombie = true;
        store.get_mut(b).imports[0].provider = Some(ExportId {
            generation: a,
            index: 0,
        });
        store.get_mut(b).resolved = true;
        store.get_mut(c).imports[0].provider = Some(ExportId {
            generation: b,
            index: 0,
        });
        store.get_mut(c).resolved = true;

        let affected = graph.zombie_affected(&store, &[]);
        assert_eq!(affected, vec![BundleId(1), BundleId(2), BundleId(3)]);
    }

    #[test]
    fn test_zombie_affected_explicit_seed() {
        let mut store = Generations::new();
        let mut graph = PackageGraph::new();
        let a = exporter(&mut store, 1, "a", "p");
        let b = importer(&mut store, 2, "b", "p");
        graph.register(&store, a);
        graph.register(&store, b);
        store.get_mut(b).imports[0].provider = Some(ExportId {
            generation: a,
            index: 0,
        });
        store.get_mut(b).resolved = true;

        let affected = graph.zombie_affected(&store, &[BundleId(1)]);
        assert_eq!(affected, vec![BundleId(1), BundleId(2)]);

        // An unrelated seed pulls in nothing else
        let affected = graph.zombie_affected(&store, &[BundleId(2)]);
        assert_eq!(affected, vec![BundleId(2)]);
    }
}
