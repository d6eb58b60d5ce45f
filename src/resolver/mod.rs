// src/resolver/mod.rs

//! The resolution transaction
//!
//! Given one bundle generation (or a single dynamic import), decide whether
//! a consistent set of providers exists for its entire requirement set,
//! recursing into any not-yet-resolved generation that could serve as a
//! provider. All tentative choices live in a scratch workspace; the global
//! graph is mutated only by [`ResolutionTransaction::commit`], which runs
//! only on full success. A failed attempt leaves the graph byte-for-byte
//! untouched.
//!
//! Provider search is deterministic: candidates are scanned in declaration
//! order, already-resolved exporters are preferred over cascading into an
//! INSTALLED bundle, and an exporter rejected by the uses-consistency check
//! is blacklisted for the remainder of the transaction.
//!
//! Callers run one transaction at a time under the runtime's resolution
//! lock; the workspace is not shareable across concurrent transactions.

use crate::bundle::{ExportId, GenerationId, Generations};
use crate::error::{Error, Result};
use crate::manifest::{ImportMode, ImportSpec, RequireMode, RequireSpec, Visibility};
use crate::graph::PackageGraph;
use crate::policy::Policy;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Outcome of a successful resolution attempt
#[derive(Debug)]
pub struct ResolutionReport {
    /// Every generation this transaction moved to resolved, target first
    pub resolved: Vec<GenerationId>,
    /// Fragments detached from the target host to make resolution succeed
    pub detached_fragments: Vec<GenerationId>,
}

/// Resolve one bundle generation, retrying with fewer fragments on failure
///
/// If resolution of the host fails with fragments attached, the
/// least-preferred (highest bundle id) fragment is detached and the whole
/// attempt restarts, until resolution succeeds or no fragments remain. On
/// outright failure every detached fragment is reattached, so a failed call
/// has no observable effect.
pub fn resolve_bundle(
    store: &mut Generations,
    graph: &mut PackageGraph,
    policy: &dyn Policy,
    target: GenerationId,
) -> Result<ResolutionReport> {
    if store.get(target).resolved {
        // Idempotent: a second resolve of a resolved generation is a no-op
        return Ok(ResolutionReport {
            resolved: Vec::new(),
            detached_fragments: Vec::new(),
        });
    }

    let mut detached = Vec::new();
    loop {
        let mut txn = ResolutionTransaction::new(store, graph, policy);
        match txn.resolve_generation(target) {
            Ok(()) => {
                let resolved = txn.commit(target);
                debug!(target = %target, count = resolved.len(), "resolution committed");
                return Ok(ResolutionReport {
                    resolved,
                    detached_fragments: detached,
                });
            }
            Err(err) => {
                drop(txn); // discard the workspace
                let fragments = store.get(target).fragments.clone();
                match fragments.last() {
                    Some(&least_preferred) => {
                        debug!(
                            host = %target,
                            fragment = %least_preferred,
                            "resolution failed, detaching fragment and retrying"
                        );
                        store.detach_fragment(target, least_preferred);
                        graph.resync(store, target);
                        detached.push(least_preferred);
                    }
                    None => {
                        // Failed outright: restore the attachments we undid
                        for fragment in detached.drain(..).rev() {
                            store.attach_fragment(target, fragment);
                        }
                        graph.resync(store, target);
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Resolve a single dynamic import on an already-resolved generation
///
/// Identical machinery scoped to one package: success or failure affects
/// only this import, never the generation's resolved status. The first
/// successful binding wins; later calls for the same package return it
/// unchanged.
pub fn resolve_dynamic(
    store: &mut Generations,
    graph: &mut PackageGraph,
    policy: &dyn Policy,
    target: GenerationId,
    package: &str,
) -> Result<ExportId> {
    let generation = store.get(target);
    if !generation.resolved {
        return Err(Error::Resolution {
            bundle: generation.bundle_id,
            reason: format!("dynamic import of {} on an unresolved generation", package),
        });
    }

    // First-bind-wins: an existing wire for this package answers immediately
    if let Some(provider) = generation
        .imports
        .iter()
        .filter(|i| i.spec.package == package)
        .find_map(|i| i.provider)
    {
        return Ok(provider);
    }

    // An exact declaration, or a concrete entry spawned by an earlier
    // wildcard lookup, is reused; only a wildcard with no concrete entry
    // yet spawns a new one
    let concrete = generation
        .imports
        .iter()
        .position(|i| i.spec.mode == ImportMode::Dynamic && i.spec.package == package);
    let (import_idx, spawned) = match concrete {
        Some(idx) => (idx as u32, false),
        None => {
            let Some(pattern_idx) = generation.imports.iter().position(|i| {
                i.spec.mode == ImportMode::Dynamic
                    && dynamic_pattern_matches(&i.spec.package, package)
            }) else {
                return Err(Error::Resolution {
                    bundle: generation.bundle_id,
                    reason: format!("no dynamic import declaration covers {}", package),
                });
            };
            let mut spec = generation.imports[pattern_idx].spec.clone();
            spec.package = package.to_string();
            let generation = store.get_mut(target);
            generation.imports.push(crate::bundle::ImportPkg {
                spec,
                provider: None,
                dynamic_ordinal: None,
                from_fragment: None,
            });
            let idx = (generation.imports.len() - 1) as u32;
            graph.register(store, target);
            (idx, true)
        }
    };

    let spec = store.get(target).imports[import_idx as usize].spec.clone();
    let mut txn = ResolutionTransaction::new(store, graph, policy);
    let outcome = txn.resolve_import(target, import_idx, &spec)?;
    let provider = txn
        .temp_wires
        .iter()
        .find(|&&(g, i, _)| g == target && i == import_idx)
        .map(|&(_, _, export)| export);
    match (outcome, provider) {
        (ImportOutcome::Bound, Some(provider)) => {
            txn.commit(target);
            let generation = store.get_mut(target);
            let ordinal = generation.next_dynamic_ordinal;
            generation.next_dynamic_ordinal += 1;
            generation.imports[import_idx as usize].dynamic_ordinal = Some(ordinal);
            debug!(target = %target, package, ordinal, "dynamic import wired");
            Ok(provider)
        }
        _ => {
            if spawned {
                // A failed lookup must leave the generation as it was
                store.get_mut(target).imports.pop();
                graph.resync(store, target);
            }
            Err(Error::Resolution {
                bundle: store.get(target).bundle_id,
                reason: format!("no provider for dynamically imported package {}", package),
            })
        }
    }
}

/// Does a dynamic import declaration (exact name, "prefix.*", or "*")
/// cover a concrete package name?
fn dynamic_pattern_matches(pattern: &str, package: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return package.starts_with(prefix)
            && package.len() > prefix.len()
            && package.as_bytes()[prefix.len()] == b'.';
    }
    pattern == package
}

/// Snapshot of the backtrackable part of the workspace
///
/// The blacklist is deliberately absent: an exporter rejected once is never
/// retried within the transaction, even if the sub-attempt that rejected it
/// is rolled back.
#[derive(Clone)]
struct Checkpoint {
    temp_resolved: Vec<GenerationId>,
    temp_provider: HashMap<String, ExportId>,
    temp_required: Vec<(GenerationId, u32, GenerationId)>,
    temp_wires: Vec<(GenerationId, u32, ExportId)>,
    seeded_by: HashMap<String, ExportId>,
}

/// How one import declaration fared against the workspace
enum ImportOutcome {
    Bound,
    /// No qualifying exporter; the caller decides whether that is fatal
    Unbound,
    /// The importer rejected an already-tentative provider; the named
    /// exporter is the one whose selection introduced it
    Conflict(ExportId),
}

/// One in-flight resolution attempt and its scratch workspace
pub struct ResolutionTransaction<'a> {
    store: &'a mut Generations,
    graph: &'a mut PackageGraph,
    policy: &'a dyn Policy,
    /// Generations tentatively resolved in this transaction; doubles as the
    /// cycle guard
    temp_resolved: Vec<GenerationId>,
    /// Package name → tentatively chosen exporter
    temp_provider: HashMap<String, ExportId>,
    /// (requirer, require index, provider) bindings
    temp_required: Vec<(GenerationId, u32, GenerationId)>,
    /// (importer, import index, exporter) bindings
    temp_wires: Vec<(GenerationId, u32, ExportId)>,
    /// Exporters rejected in this transaction, never retried within it
    temp_blacklist: HashSet<ExportId>,
    /// Package name → the exporter whose selection pulled its tentative
    /// provider into the workspace, for conflict backtracking
    seeded_by: HashMap<String, ExportId>,
}

impl<'a> ResolutionTransaction<'a> {
    fn new(
        store: &'a mut Generations,
        graph: &'a mut PackageGraph,
        policy: &'a dyn Policy,
    ) -> Self {
        Self {
            store,
            graph,
            policy,
            temp_resolved: Vec::new(),
            temp_provider: HashMap::new(),
            temp_required: Vec::new(),
            temp_wires: Vec::new(),
            temp_blacklist: HashSet::new(),
            seeded_by: HashMap::new(),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            temp_resolved: self.temp_resolved.clone(),
            temp_provider: self.temp_provider.clone(),
            temp_required: self.temp_required.clone(),
            temp_wires: self.temp_wires.clone(),
            seeded_by: self.seeded_by.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.temp_resolved = checkpoint.temp_resolved;
        self.temp_provider = checkpoint.temp_provider;
        self.temp_required = checkpoint.temp_required;
        self.temp_wires = checkpoint.temp_wires;
        self.seeded_by = checkpoint.seeded_by;
    }

    /// Attempt to place one generation and its whole requirement subtree
    /// into the tentative workspace
    fn resolve_generation(&mut self, g: GenerationId) -> Result<()> {
        if self.store.get(g).resolved || self.temp_resolved.contains(&g) {
            return Ok(());
        }

        let generation = self.store.get(g);
        let bundle_id = generation.bundle_id;
        if generation.uninstalled {
            return Err(Error::Resolution {
                bundle: bundle_id,
                reason: "bundle has been uninstalled".to_string(),
            });
        }
        if generation.is_fragment() {
            // Fragments resolve through their host's transaction only
            return Err(Error::Resolution {
                bundle: bundle_id,
                reason: "a fragment cannot be resolved independently".to_string(),
            });
        }

        self.check_singleton(g)?;
        self.temp_resolved.push(g);
        trace!(generation = %g, "tentatively resolving");

        let requires: Vec<(u32, RequireSpec)> = self
            .store
            .get(g)
            .requires
            .iter()
            .enumerate()
            .map(|(i, r)| (i as u32, r.spec.clone()))
            .collect();
        for (index, spec) in requires {
            self.resolve_require(g, index, &spec)?;
        }

        let imports: Vec<(u32, ImportSpec)> = self
            .store
            .get(g)
            .imports
            .iter()
            .enumerate()
            .map(|(i, imp)| (i as u32, imp.spec.clone()))
            .collect();
        // A conflict against an earlier tentative binding rolls the import
        // phase back, blacklists the exporter that seeded the binding, and
        // retries. The blacklist survives the rollback and only grows, so
        // the loop terminates.
        let import_checkpoint = self.checkpoint();
        'imports: loop {
            let mut missing = Vec::new();
            for (index, spec) in &imports {
                if spec.mode == ImportMode::Dynamic {
                    // Wired lazily, on first failed lookup
                    continue;
                }
                match self.resolve_import(g, *index, spec)? {
                    ImportOutcome::Bound => {}
                    ImportOutcome::Unbound => {
                        if spec.mode == ImportMode::Mandatory {
                            missing.push(spec.package.clone());
                        }
                    }
                    ImportOutcome::Conflict(seeder) => {
                        if self.temp_blacklist.insert(seeder) {
                            self.restore(import_checkpoint.clone());
                            trace!(
                                seeder = ?seeder,
                                package = %spec.package,
                                "tentative provider rejected, retrying without its seeder"
                            );
                            continue 'imports;
                        }
                        if spec.mode == ImportMode::Mandatory {
                            missing.push(spec.package.clone());
                        }
                    }
                }
            }
            if !missing.is_empty() {
                return Err(Error::Resolution {
                    bundle: bundle_id,
                    reason: format!("missing packages: {}", missing.join(", ")),
                });
            }
            return Ok(());
        }
    }

    /// Fail fast if another singleton generation with the same symbolic
    /// name is already resolved or tentatively resolved
    fn check_singleton(&self, g: GenerationId) -> Result<()> {
        let generation = self.store.get(g);
        if !generation.manifest.singleton {
            return Ok(());
        }
        let Some(name) = generation.symbolic_name() else {
            return Ok(());
        };
        for other in self.store.find_symbolic(name) {
            if other == g {
                continue;
            }
            let o = self.store.get(other);
            if o.manifest.singleton && (o.resolved || self.temp_resolved.contains(&other)) {
                return Err(Error::SingletonConflict {
                    symbolic_name: name.to_string(),
                    blocker: o.display_name(),
                });
            }
        }
        Ok(())
    }

    /// Find a provider bundle for one Require-Bundle declaration
    ///
    /// Preference order: a generation already tentatively resolved in this
    /// transaction, then an already-resolved generation whose exports pass
    /// the uses-consistency check, then an INSTALLED generation that can be
    /// recursively resolved here. Optional requirements that fail are
    /// skipped; mandatory failures abort the transaction with the blocking
    /// symbolic name.
    fn resolve_require(&mut self, g: GenerationId, index: u32, spec: &RequireSpec) -> Result<()> {
        let requirer_bundle = self.store.get(g).bundle_id;
        let candidates: Vec<GenerationId> = self
            .store
            .find_symbolic(&spec.symbolic_name)
            .into_iter()
            .filter(|&c| c != g)
            .filter(|&c| {
                let cand = self.store.get(c);
                !cand.is_fragment()
                    && !cand.uninstalled
                    && spec.version_range.includes(cand.version())
                    && self.policy.may_require(requirer_bundle, cand.bundle_id)
            })
            .collect();

        if let Some(&c) = candidates
            .iter()
            .find(|&&c| self.temp_resolved.contains(&c))
        {
            self.temp_required.push((g, index, c));
            return Ok(());
        }

        let already_resolved: Vec<GenerationId> = candidates
            .iter()
            .copied()
            .filter(|&c| self.store.get(c).resolved)
            .collect();
        for c in already_resolved {
            if self.exports_uses_consistent(c) {
                self.temp_required.push((g, index, c));
                return Ok(());
            }
            // A rejected Require-Bundle target is not revisited within this
            // transaction, mirroring the exporter blacklist
        }

        let installed: Vec<GenerationId> = candidates
            .iter()
            .copied()
            .filter(|&c| !self.store.get(c).resolved)
            .collect();
        for c in installed {
            let checkpoint = self.checkpoint();
            match self.resolve_generation(c) {
                Ok(()) if self.exports_uses_consistent(c) => {
                    self.temp_required.push((g, index, c));
                    return Ok(());
                }
                _ => self.restore(checkpoint),
            }
        }

        match spec.mode {
            RequireMode::Optional => Ok(()),
            RequireMode::Mandatory => Err(Error::Resolution {
                bundle: requirer_bundle,
                reason: format!("blocked by {}", spec.symbolic_name),
            }),
        }
    }

    /// Do all of a candidate provider's exports survive the
    /// uses-consistency check against the current workspace?
    fn exports_uses_consistent(&mut self, provider: GenerationId) -> bool {
        let count = self.store.get(provider).exports.len() as u32;
        let saved = self.temp_provider.clone();
        for index in 0..count {
            let export = ExportId {
                generation: provider,
                index,
            };
            if self.store.export(export).zombie {
                continue;
            }
            let mut visited = HashSet::new();
            if !self.check_uses(export, &mut visited) {
                self.temp_provider = saved;
                return false;
            }
        }
        true
    }

    /// Find a provider for one import declaration
    fn resolve_import(
        &mut self,
        g: GenerationId,
        index: u32,
        spec: &ImportSpec,
    ) -> Result<ImportOutcome> {
        let package = spec.package.as_str();

        // A tentative provider for this package already exists: reuse it if
        // it still passes this importer's checks. A second provider for the
        // same package can never be introduced within one transaction, so a
        // rejection here is a conflict with whatever selection seeded it.
        if let Some(&tentative) = self.temp_provider.get(package) {
            if self.export_usable(g, spec, tentative) {
                self.temp_wires.push((g, index, tentative));
                return Ok(ImportOutcome::Bound);
            }
            let seeder = self.seeded_by.get(package).copied().unwrap_or(tentative);
            return Ok(ImportOutcome::Conflict(seeder));
        }

        let candidates: Vec<ExportId> = self.graph.exporters(package).to_vec();

        // Pass 1: exporters whose owner is resolved (or tentatively so),
        // preferring an already-selected provider over deriving a new one
        let selected: Vec<ExportId> = self.graph.selected(package).to_vec();
        let active_order = selected.iter().chain(
            candidates
                .iter()
                .filter(|c| !selected.contains(c)),
        );
        let active: Vec<ExportId> = active_order
            .copied()
            .filter(|c| {
                let owner = c.generation;
                self.store.get(owner).resolved || self.temp_resolved.contains(&owner)
            })
            .collect();
        for cand in active {
            if self.try_select(g, index, spec, cand)? {
                return Ok(ImportOutcome::Bound);
            }
        }

        // Pass 2: INSTALLED exporters, resolved recursively within this
        // same transaction so one resolve request can cascade atomically
        for cand in candidates {
            let owner = cand.generation;
            if self.store.get(owner).resolved || self.temp_resolved.contains(&owner) {
                continue;
            }
            if self.temp_blacklist.contains(&cand) {
                continue;
            }
            let owner_gen = self.store.get(owner);
            if owner_gen.uninstalled || owner_gen.is_fragment() {
                continue;
            }
            if !self.export_usable(g, spec, cand) {
                continue;
            }
            let checkpoint = self.checkpoint();
            match self.resolve_generation(owner) {
                Ok(()) => {
                    if self.try_select(g, index, spec, cand)? {
                        return Ok(ImportOutcome::Bound);
                    }
                    self.restore(checkpoint);
                }
                Err(err) => {
                    trace!(candidate = %owner, error = %err, "cascade candidate unresolvable");
                    self.restore(checkpoint);
                }
            }
        }

        Ok(ImportOutcome::Unbound)
    }

    /// Vet one candidate exporter for one importer; on success record it as
    /// the tentative provider, on uses-failure blacklist it
    fn try_select(
        &mut self,
        g: GenerationId,
        index: u32,
        spec: &ImportSpec,
        candidate: ExportId,
    ) -> Result<bool> {
        if self.temp_blacklist.contains(&candidate) {
            return Ok(false);
        }
        if !self.export_usable(g, spec, candidate) {
            return Ok(false);
        }

        let saved = self.temp_provider.clone();
        self.temp_provider
            .insert(spec.package.clone(), candidate);
        let mut visited = HashSet::new();
        if self.check_uses(candidate, &mut visited) {
            // Every binding this selection introduced, including its own,
            // traces back to the candidate for conflict backtracking
            let gained: Vec<String> = self
                .temp_provider
                .keys()
                .filter(|p| !saved.contains_key(*p))
                .cloned()
                .collect();
            for pkg in gained {
                self.seeded_by.insert(pkg, candidate);
            }
            self.temp_wires.push((g, index, candidate));
            Ok(true)
        } else {
            self.temp_provider = saved;
            self.temp_blacklist.insert(candidate);
            trace!(candidate = ?candidate, package = %spec.package, "uses conflict, blacklisted");
            Ok(false)
        }
    }

    /// Attribute, version, bundle-constraint and permission vetting of a
    /// candidate exporter for one importer
    fn export_usable(&self, g: GenerationId, spec: &ImportSpec, candidate: ExportId) -> bool {
        let export = self.store.export(candidate);
        if export.zombie {
            return false;
        }
        let owner = self.store.get(candidate.generation);
        if owner.uninstalled {
            return false;
        }
        if export.spec.package != spec.package {
            return false;
        }
        if !spec.version_range.includes(&export.spec.version) {
            return false;
        }
        // Mandatory attributes must be named by the importer
        for name in &export.spec.mandatory {
            if !spec.attributes.contains_key(name) {
                return false;
            }
        }
        // Importer attribute filter must match the export's values
        for (key, value) in &spec.attributes {
            if export.spec.attributes.get(key) != Some(value) {
                return false;
            }
        }
        if let Some(ref bsn) = spec.bundle_symbolic_name {
            if owner.symbolic_name() != Some(bsn.as_str()) {
                return false;
            }
        }
        if let Some(ref range) = spec.bundle_version_range {
            if !range.includes(owner.version()) {
                return false;
            }
        }

        let importer_bundle = self.store.get(g).bundle_id;
        self.policy
            .may_export(owner.bundle_id, &export.spec.package)
            && self
                .policy
                .may_import(importer_bundle, &export.spec.package, owner.bundle_id)
    }

    /// The uses-consistency check: every package reachable through the
    /// candidate's `uses` set must resolve to one single exporter across
    /// the whole transaction
    ///
    /// Returns false without repairing `temp_provider`; the caller restores
    /// its saved copy.
    fn check_uses(&mut self, export: ExportId, visited: &mut HashSet<ExportId>) -> bool {
        if !visited.insert(export) {
            return true;
        }
        let owner = export.generation;
        let uses: Vec<String> = {
            let e = self.store.export(export);
            if e.spec.uses.is_empty() {
                // No declared uses set: fall back to the owner's active
                // imports, which over-approximates its implementation
                // dependencies
                self.store
                    .get(owner)
                    .imports
                    .iter()
                    .filter(|i| i.spec.mode != ImportMode::Dynamic)
                    .map(|i| i.spec.package.clone())
                    .collect()
            } else {
                e.spec.uses.clone()
            }
        };

        for package in uses {
            let expected = self.owner_binding(owner, &package);
            let chosen = self.temp_provider.get(&package).copied();
            match (expected, chosen) {
                (Some(theirs), Some(ours)) if theirs != ours => {
                    trace!(
                        package = %package,
                        theirs = ?theirs,
                        ours = ?ours,
                        "uses conflict: two providers visible for one package"
                    );
                    return false;
                }
                (Some(theirs), existing) => {
                    if existing.is_none() {
                        self.temp_provider.insert(package.clone(), theirs);
                    }
                    if !self.check_uses(theirs, visited) {
                        return false;
                    }
                }
                (None, Some(ours)) => {
                    if !self.check_uses(ours, visited) {
                        return false;
                    }
                }
                (None, None) => {}
            }
        }
        true
    }

    /// Which exporter does this generation see for a package: a committed
    /// wire first, then its own export of the package
    fn owner_binding(&self, owner: GenerationId, package: &str) -> Option<ExportId> {
        let generation = self.store.get(owner);
        if let Some(import) = generation.imports.iter().find(|i| i.spec.package == package) {
            if let Some(provider) = import.provider {
                return Some(provider);
            }
        }
        for (index, export) in generation.exports.iter().enumerate() {
            if export.spec.package == package && !export.zombie {
                return Some(ExportId {
                    generation: owner,
                    index: index as u32,
                });
            }
        }
        None
    }

    /// Merge the workspace into the graph. All-or-nothing: this is the only
    /// mutation path out of a transaction.
    fn commit(self, target: GenerationId) -> Vec<GenerationId> {
        for (package, export) in &self.temp_provider {
            self.graph.select(package, *export);
        }

        for &(g, index, provider) in &self.temp_required {
            self.store.get_mut(g).requires[index as usize].provider = Some(provider);
            self.store.get_mut(provider).required_by.push(g);
        }
        // Reexport visibility: the requirer gains entries for everything
        // the provider exports, transitively through the provider's own
        // reexports
        for &(g, index, provider) in &self.temp_required {
            if self.store.get(g).requires[index as usize].spec.visibility != Visibility::Reexport {
                continue;
            }
            let mut gained: Vec<ExportId> = Vec::new();
            let provider_gen = self.store.get(provider);
            for (i, export) in provider_gen.exports.iter().enumerate() {
                if !export.zombie {
                    gained.push(ExportId {
                        generation: provider,
                        index: i as u32,
                    });
                }
            }
            gained.extend(provider_gen.reexports.iter().copied());
            let requirer = self.store.get_mut(g);
            for export in gained {
                if !requirer.reexports.contains(&export) {
                    requirer.reexports.push(export);
                }
            }
        }

        for &(g, index, export) in &self.temp_wires {
            self.store.get_mut(g).imports[index as usize].provider = Some(export);
        }

        let mut resolved = self.temp_resolved;
        if let Some(pos) = resolved.iter().position(|&g| g == target) {
            resolved.swap(0, pos);
        }
        for &g in &resolved {
            let fragments = {
                let generation = self.store.get_mut(g);
                generation.resolved = true;
                generation.fragments.clone()
            };
            self.store.assign_loader(g);
            // Attached fragments resolve with their host
            for fragment in fragments {
                self.store.get_mut(fragment).resolved = true;
            }
        }
        resolved
    }
}
