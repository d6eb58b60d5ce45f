// src/lifecycle/mod.rs

//! Bundle lifecycle and the runtime facade
//!
//! [`ModuleRuntime`] owns the bundle table, the generation arena, and the
//! package graph behind one explicit mutex. Every lifecycle transition
//! takes an advisory per-bundle operation guard with a bounded wait, so a
//! caller colliding with an in-flight transition blocks briefly instead of
//! failing immediately.
//!
//! Activator callbacks run with the runtime lock released; the operation
//! guard stays held across the call so no second transition can interleave.
//! Events are collected under the lock and dispatched after it is dropped.

use crate::bundle::{Bundle, BundleId, GenerationId, Generations};
use crate::error::{Error, Result};
use crate::events::{BundleEvent, BundleEventKind, EventDispatcher, EventListener, FrameworkError};
use crate::graph::PackageGraph;
use crate::loader::{Delegation, Lookup};
use crate::manifest::{BundleManifest, FragmentAttachment, ImportMode};
use crate::policy::{AllowAll, Policy};
use crate::resolver;
use crate::storage::{BundleStore, StoredBundle};
use crate::version::BundleVersion;
use chrono::Utc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::Display;
use tracing::{debug, info, warn};

/// Wait bound for quick transitions (resolve, start, stop)
pub const SHORT_WAIT: Duration = Duration::from_millis(200);
/// Wait bound for structural transitions (update, uninstall, refresh)
pub const LONG_WAIT: Duration = Duration::from_secs(2);

/// Observable lifecycle state of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BundleState {
    /// Present but unresolved
    Installed,
    /// Wired into the graph, code loadable
    Resolved,
    /// Activation in progress, or deferred under a lazy policy
    Starting,
    Active,
    Stopping,
    /// Terminal
    Uninstalled,
}

impl BundleState {
    /// States from which stop has work to do
    pub fn is_running(self) -> bool {
        matches!(self, BundleState::Starting | BundleState::Active)
    }
}

/// Advisory marker for the transition currently holding a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Idle,
    Resolving,
    Starting,
    Stopping,
    Updating,
    Uninstalling,
    Refreshing,
}

/// Caller flags for start and stop
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Do not record the start as the bundle's persistent autostart setting
    pub transient: bool,
    /// Honor a declared lazy activation policy instead of activating
    /// eagerly
    pub use_activation_policy: bool,
}

impl StartOptions {
    pub fn transient() -> Self {
        Self {
            transient: true,
            use_activation_policy: false,
        }
    }

    pub fn lazy() -> Self {
        Self {
            transient: false,
            use_activation_policy: true,
        }
    }
}

/// What an activator is told about its own bundle
#[derive(Debug, Clone)]
pub struct BundleContext {
    pub bundle: BundleId,
    pub symbolic_name: Option<String>,
    pub version: BundleVersion,
}

impl fmt::Display for BundleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbolic_name {
            Some(name) => write!(f, "{}:{}", name, self.version),
            None => write!(f, "{}", self.bundle),
        }
    }
}

/// User-supplied entry point, invoked outside the runtime lock
pub trait BundleActivator: Send + Sync {
    fn start(&self, ctx: &BundleContext) -> anyhow::Result<()>;

    fn stop(&self, ctx: &BundleContext) -> anyhow::Result<()>;
}

/// Activator call staged while the lock was held
struct PendingActivation {
    ctx: BundleContext,
    activator: Option<Arc<dyn BundleActivator>>,
}

/// Everything behind the runtime mutex
struct Core {
    bundles: BTreeMap<BundleId, Bundle>,
    store: Generations,
    graph: PackageGraph,
    activators: HashMap<BundleId, Arc<dyn BundleActivator>>,
    start_order: Vec<BundleId>,
    next_bundle: u64,
    /// Bumped whenever install, update, uninstall or refresh changes what a
    /// resolution attempt could see; cached failures from older epochs are
    /// retried instead of replayed
    epoch: u64,
}

impl Core {
    fn bundle(&self, id: BundleId) -> Result<&Bundle> {
        self.bundles.get(&id).ok_or(Error::NoSuchBundle(id))
    }

    fn bundle_mut(&mut self, id: BundleId) -> Result<&mut Bundle> {
        self.bundles.get_mut(&id).ok_or(Error::NoSuchBundle(id))
    }

    fn context_for(&self, id: BundleId) -> Result<BundleContext> {
        let generation = self.store.get(self.bundle(id)?.current);
        Ok(BundleContext {
            bundle: id,
            symbolic_name: generation.symbolic_name().map(str::to_string),
            version: generation.version().clone(),
        })
    }
}

/// The runtime facade: install, resolve, start, stop, update, uninstall,
/// refresh, shutdown
pub struct ModuleRuntime {
    core: Mutex<Core>,
    cond: Condvar,
    dispatcher: Mutex<EventDispatcher>,
    policy: Box<dyn Policy>,
    persist: Option<Box<dyn BundleStore>>,
}

impl Default for ModuleRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRuntime {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(Core {
                bundles: BTreeMap::new(),
                store: Generations::new(),
                graph: PackageGraph::new(),
                activators: HashMap::new(),
                start_order: Vec::new(),
                next_bundle: 1,
                epoch: 0,
            }),
            cond: Condvar::new(),
            dispatcher: Mutex::new(EventDispatcher::new()),
            policy: Box::new(AllowAll),
            persist: None,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_storage(mut self, store: Box<dyn BundleStore>) -> Self {
        self.persist = Some(store);
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.dispatcher.lock().add_listener(listener);
    }

    // ------------------------------------------------------------------
    // install

    pub fn install(&self, location: impl Into<String>, manifest: BundleManifest) -> Result<BundleId> {
        manifest.validate()?;
        let location = location.into();
        let mut events = Vec::new();

        let id = {
            let mut core = self.core.lock();
            let id = BundleId(core.next_bundle);
            core.next_bundle += 1;
            let generation = core.store.insert(id, 1, manifest.clone());
            if !core.store.get(generation).is_fragment() {
                let Core {
                    ref store,
                    ref mut graph,
                    ..
                } = *core;
                graph.register(store, generation);
            }
            core.bundles.insert(id, Bundle::new(id, location.clone(), generation));
            core.epoch += 1;
            events.push(BundleEvent::new(id, BundleEventKind::Installed));
            id
        };
        info!(bundle = %id, location = %location, "bundle installed");

        self.persist_record(id, &location, 1, &manifest);
        self.dispatch(events);
        Ok(id)
    }

    pub fn install_with_activator(
        &self,
        location: impl Into<String>,
        manifest: BundleManifest,
        activator: Arc<dyn BundleActivator>,
    ) -> Result<BundleId> {
        let id = self.install(location, manifest)?;
        self.core.lock().activators.insert(id, activator);
        Ok(id)
    }

    /// Replay persisted bundles into a fresh runtime, starting the ones
    /// marked autostart
    pub fn load_persisted(&self) -> Result<Vec<BundleId>> {
        let Some(store) = self.persist.as_ref() else {
            return Ok(Vec::new());
        };
        let records = store.load_all()?;
        let mut installed = Vec::new();
        let mut autostart = Vec::new();
        for record in records {
            let id = self.install(record.location.clone(), record.manifest.clone())?;
            if record.autostart {
                autostart.push(id);
            }
            installed.push(id);
        }
        for id in autostart {
            if let Err(err) = self.start(id, StartOptions::transient()) {
                self.framework_error(Some(id), format!("autostart failed: {}", err));
            }
        }
        Ok(installed)
    }

    // ------------------------------------------------------------------
    // resolve

    /// Resolve a bundle's current generation, or replay the cached failure
    /// from this epoch
    ///
    /// Idempotent on resolved bundles. A caller arriving while another
    /// thread resolves the same bundle waits briefly and then observes that
    /// thread's outcome.
    pub fn resolve(&self, id: BundleId) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let mut core = self.core.lock();
            self.begin(&mut core, id, Operation::Resolving, SHORT_WAIT)?;
            let result = self.resolve_locked(&mut core, id, &mut events);
            self.end(&mut core, id);
            result
        };
        self.cond.notify_all();
        self.dispatch(events);
        result
    }

    fn resolve_locked(
        &self,
        core: &mut Core,
        id: BundleId,
        events: &mut Vec<BundleEvent>,
    ) -> Result<()> {
        let bundle = core.bundle(id)?;
        match bundle.state {
            BundleState::Uninstalled => {
                return Err(Error::IllegalState {
                    bundle: id,
                    state: bundle.state.to_string(),
                    action: "resolve",
                });
            }
            BundleState::Installed => {}
            _ => return Ok(()),
        }
        if let Some((epoch, reason)) = &bundle.failure {
            if *epoch == core.epoch {
                return Err(Error::Resolution {
                    bundle: id,
                    reason: reason.clone(),
                });
            }
        }

        let target = bundle.current;
        let result = if core.store.get(target).is_fragment() {
            self.resolve_fragment_locked(core, id, target, events)
        } else {
            self.resolve_host_locked(core, target, events)
        };

        if let Err(ref err) = result {
            let reason = match err {
                Error::Resolution { reason, .. } => reason.clone(),
                other => other.to_string(),
            };
            let epoch = core.epoch;
            if let Ok(bundle) = core.bundle_mut(id) {
                bundle.failure = Some((epoch, reason));
            }
        }
        result
    }

    /// Resolve a host generation, auto-attaching any installed fragment
    /// whose host filter matches
    fn resolve_host_locked(
        &self,
        core: &mut Core,
        host: GenerationId,
        events: &mut Vec<BundleEvent>,
    ) -> Result<()> {
        if core.store.get(host).manifest.fragment_attachment != FragmentAttachment::Never {
            let candidates = self.attachable_fragments(core, host);
            if !candidates.is_empty() {
                for fragment in candidates {
                    core.store.attach_fragment(host, fragment);
                }
                core.graph.resync(&core.store, host);
            }
        }

        let report = resolver::resolve_bundle(
            &mut core.store,
            &mut core.graph,
            self.policy.as_ref(),
            host,
        )?;
        self.apply_resolution(core, &report, events);
        Ok(())
    }

    /// Installed, unattached fragments whose host filter matches this
    /// generation, in bundle id order
    fn attachable_fragments(&self, core: &Core, host: GenerationId) -> Vec<GenerationId> {
        let host_gen = core.store.get(host);
        let host_bundle = host_gen.bundle_id;
        let host_name = match host_gen.symbolic_name() {
            Some(name) => name.to_string(),
            None => return Vec::new(),
        };
        let host_version = host_gen.version().clone();

        let mut out: Vec<(BundleId, GenerationId)> = core
            .store
            .iter()
            .filter(|g| g.is_fragment() && g.host.is_none() && !g.uninstalled && !g.resolved)
            .filter(|g| {
                let Some(spec) = g.manifest.fragment_host.as_ref() else {
                    return false;
                };
                spec.symbolic_name == host_name && spec.version_range.includes(&host_version)
            })
            .filter(|g| {
                // Only a bundle's current generation attaches
                core.bundles
                    .get(&g.bundle_id)
                    .is_some_and(|b| b.current == g.id && b.state == BundleState::Installed)
            })
            .filter(|g| self.policy.may_attach(g.bundle_id, host_bundle))
            .map(|g| (g.bundle_id, g.id))
            .collect();
        out.sort();
        out.into_iter().map(|(_, g)| g).collect()
    }

    fn resolve_fragment_locked(
        &self,
        core: &mut Core,
        id: BundleId,
        fragment: GenerationId,
        events: &mut Vec<BundleEvent>,
    ) -> Result<()> {
        let host_spec = match core.store.get(fragment).manifest.fragment_host.clone() {
            Some(spec) => spec,
            None => {
                return Err(Error::IllegalState {
                    bundle: id,
                    state: "installed".to_string(),
                    action: "resolve as fragment",
                });
            }
        };

        // Pick the first matching host by bundle id
        let mut hosts: Vec<(BundleId, GenerationId)> = core
            .store
            .iter()
            .filter(|g| !g.is_fragment() && !g.uninstalled)
            .filter(|g| {
                g.symbolic_name() == Some(host_spec.symbolic_name.as_str())
                    && host_spec.version_range.includes(g.version())
            })
            .filter(|g| g.manifest.fragment_attachment != FragmentAttachment::Never)
            .filter(|g| {
                core.bundles
                    .get(&g.bundle_id)
                    .is_some_and(|b| b.current == g.id && b.state != BundleState::Uninstalled)
            })
            .filter(|g| self.policy.may_attach(id, g.bundle_id))
            .map(|g| (g.bundle_id, g.id))
            .collect();
        hosts.sort();
        let Some(&(host_bundle, host)) = hosts.first() else {
            return Err(Error::Resolution {
                bundle: id,
                reason: format!("no host matching {}", host_spec.symbolic_name),
            });
        };

        if core.store.get(host).resolved {
            // Dynamic attach: legal only when the host allows it and the
            // fragment adds no dependencies of its own, because the host's
            // wiring is already fixed
            let generation = core.store.get(host);
            if generation.manifest.fragment_attachment != FragmentAttachment::Always {
                return Err(Error::Resolution {
                    bundle: id,
                    reason: format!(
                        "host {} does not accept attachment after resolution",
                        host_spec.symbolic_name
                    ),
                });
            }
            let frag = core.store.get(fragment);
            if !frag.manifest.imports.is_empty() || !frag.manifest.requires.is_empty() {
                return Err(Error::Resolution {
                    bundle: id,
                    reason: format!(
                        "fragment adds dependencies but host {} is already resolved",
                        host_spec.symbolic_name
                    ),
                });
            }
            core.store.attach_fragment(host, fragment);
            // Contributed exports become visible to future resolutions
            core.graph.register(&core.store, host);
            core.store.get_mut(fragment).resolved = true;
            self.mark_resolved(core, id, events);
            debug!(fragment = %id, host = %host_bundle, "fragment attached to resolved host");
            return Ok(());
        }

        core.store.attach_fragment(host, fragment);
        core.graph.resync(&core.store, host);
        self.resolve_host_locked(core, host, events)?;
        if !core.store.get(fragment).resolved {
            // The retry loop threw this fragment out to get the host through
            return Err(Error::Resolution {
                bundle: id,
                reason: format!(
                    "detached from host {} during resolution",
                    host_spec.symbolic_name
                ),
            });
        }
        Ok(())
    }

    /// Move every bundle the committed report touched to RESOLVED
    fn apply_resolution(
        &self,
        core: &mut Core,
        report: &resolver::ResolutionReport,
        events: &mut Vec<BundleEvent>,
    ) {
        let mut touched: Vec<BundleId> = Vec::new();
        for &generation in &report.resolved {
            touched.push(core.store.get(generation).bundle_id);
            for &fragment in &core.store.get(generation).fragments.clone() {
                touched.push(core.store.get(fragment).bundle_id);
            }
        }
        for id in touched {
            self.mark_resolved(core, id, events);
        }
    }

    fn mark_resolved(&self, core: &mut Core, id: BundleId, events: &mut Vec<BundleEvent>) {
        if let Some(bundle) = core.bundles.get_mut(&id) {
            bundle.failure = None;
            if bundle.state == BundleState::Installed {
                bundle.state = BundleState::Resolved;
                events.push(BundleEvent::new(id, BundleEventKind::Resolved));
            }
        }
    }

    // ------------------------------------------------------------------
    // start / stop

    pub fn start(&self, id: BundleId, options: StartOptions) -> Result<()> {
        let mut events = Vec::new();
        let staged = {
            let mut core = self.core.lock();
            self.begin(&mut core, id, Operation::Starting, SHORT_WAIT)?;
            match self.prepare_start(&mut core, id, options, &mut events) {
                Ok(Some(pending)) => Ok(Some(pending)), // guard stays held
                Ok(None) => {
                    self.end(&mut core, id);
                    Ok(None)
                }
                Err(err) => {
                    self.end(&mut core, id);
                    Err(err)
                }
            }
        };
        self.cond.notify_all();
        self.dispatch(std::mem::take(&mut events));

        let pending = match staged {
            Ok(Some(pending)) => pending,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        };

        let outcome = match &pending.activator {
            Some(activator) => activator.start(&pending.ctx),
            None => Ok(()),
        };

        let result = {
            let mut core = self.core.lock();
            let result = self.finish_start(&mut core, id, outcome, &mut events);
            self.end(&mut core, id);
            result
        };
        self.cond.notify_all();
        self.dispatch(events);
        result
    }

    /// Complete a lazy activation deferred by a start under
    /// [`StartOptions::lazy`], if `package` triggers it
    pub fn trigger_lazy_activation(&self, id: BundleId, package: &str) -> Result<()> {
        let mut events = Vec::new();
        let staged = {
            let mut core = self.core.lock();
            self.begin(&mut core, id, Operation::Starting, SHORT_WAIT)?;
            let staged = (|| -> Result<Option<PendingActivation>> {
                let bundle = core.bundle(id)?;
                if bundle.state != BundleState::Starting {
                    return Ok(None);
                }
                let generation = core.store.get(bundle.current);
                let triggers = generation
                    .manifest
                    .lazy_activation
                    .as_ref()
                    .is_some_and(|lazy| lazy.triggers(package));
                if !triggers {
                    return Ok(None);
                }
                Ok(Some(self.stage_activation(&core, id)?))
            })();
            match staged {
                Ok(Some(pending)) => Ok(Some(pending)),
                other => {
                    self.end(&mut core, id);
                    other
                }
            }
        };
        self.cond.notify_all();

        let pending = match staged {
            Ok(Some(pending)) => pending,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        };
        debug!(bundle = %id, package, "lazy activation triggered");

        let outcome = match &pending.activator {
            Some(activator) => activator.start(&pending.ctx),
            None => Ok(()),
        };
        let result = {
            let mut core = self.core.lock();
            let result = self.finish_start(&mut core, id, outcome, &mut events);
            self.end(&mut core, id);
            result
        };
        self.cond.notify_all();
        self.dispatch(events);
        result
    }

    fn prepare_start(
        &self,
        core: &mut Core,
        id: BundleId,
        options: StartOptions,
        events: &mut Vec<BundleEvent>,
    ) -> Result<Option<PendingActivation>> {
        let state = core.bundle(id)?.state;
        match state {
            BundleState::Uninstalled => {
                return Err(Error::IllegalState {
                    bundle: id,
                    state: state.to_string(),
                    action: "start",
                });
            }
            BundleState::Active => return Ok(None),
            BundleState::Installed => self.resolve_locked(core, id, events)?,
            BundleState::Resolved | BundleState::Starting | BundleState::Stopping => {}
        }

        if !options.transient {
            self.persist_autostart(id, true);
        }

        if core.bundle(id)?.state != BundleState::Starting {
            core.bundle_mut(id)?.state = BundleState::Starting;
            events.push(BundleEvent::new(id, BundleEventKind::Starting));
        }

        let lazy = core
            .store
            .get(core.bundle(id)?.current)
            .manifest
            .lazy_activation
            .is_some();
        if options.use_activation_policy && lazy {
            // Stays STARTING until a trigger package is touched
            return Ok(None);
        }

        Ok(Some(self.stage_activation(core, id)?))
    }

    fn stage_activation(&self, core: &Core, id: BundleId) -> Result<PendingActivation> {
        let ctx = core.context_for(id)?;
        let has_activator = core
            .store
            .get(core.bundle(id)?.current)
            .manifest
            .has_activator;
        let activator = if has_activator {
            core.activators.get(&id).cloned()
        } else {
            None
        };
        Ok(PendingActivation { ctx, activator })
    }

    fn finish_start(
        &self,
        core: &mut Core,
        id: BundleId,
        outcome: anyhow::Result<()>,
        events: &mut Vec<BundleEvent>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                let bundle = core.bundle_mut(id)?;
                bundle.state = BundleState::Active;
                core.start_order.retain(|&b| b != id);
                core.start_order.push(id);
                events.push(BundleEvent::new(id, BundleEventKind::Started));
                info!(bundle = %id, "bundle started");
                Ok(())
            }
            Err(source) => {
                core.bundle_mut(id)?.state = BundleState::Resolved;
                events.push(BundleEvent::new(id, BundleEventKind::Stopped));
                warn!(bundle = %id, error = %source, "activator start failed");
                Err(Error::Activation { bundle: id, source })
            }
        }
    }

    pub fn stop(&self, id: BundleId) -> Result<()> {
        self.stop_with(id, false)
    }

    fn stop_with(&self, id: BundleId, transient: bool) -> Result<()> {
        let mut events = Vec::new();
        let staged = {
            let mut core = self.core.lock();
            self.begin(&mut core, id, Operation::Stopping, SHORT_WAIT)?;
            let staged = self.prepare_stop(&mut core, id, transient, &mut events);
            match staged {
                Ok(Some(pending)) => Ok(Some(pending)),
                other => {
                    self.end(&mut core, id);
                    other
                }
            }
        };
        self.cond.notify_all();
        self.dispatch(std::mem::take(&mut events));

        let pending = match staged {
            Ok(Some(pending)) => pending,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        };

        let outcome = match &pending.activator {
            Some(activator) => activator.stop(&pending.ctx),
            None => Ok(()),
        };

        let result = {
            let mut core = self.core.lock();
            let result = self.finish_stop(&mut core, id, outcome, &mut events);
            self.end(&mut core, id);
            result
        };
        self.cond.notify_all();
        self.dispatch(events);
        result
    }

    fn prepare_stop(
        &self,
        core: &mut Core,
        id: BundleId,
        transient: bool,
        events: &mut Vec<BundleEvent>,
    ) -> Result<Option<PendingActivation>> {
        let state = core.bundle(id)?.state;
        if state == BundleState::Uninstalled {
            return Err(Error::IllegalState {
                bundle: id,
                state: state.to_string(),
                action: "stop",
            });
        }
        if !transient {
            self.persist_autostart(id, false);
        }
        if !state.is_running() {
            return Ok(None);
        }

        let was_active = state == BundleState::Active;
        core.bundle_mut(id)?.state = BundleState::Stopping;
        events.push(BundleEvent::new(id, BundleEventKind::Stopping));

        let mut pending = self.stage_activation(core, id)?;
        if !was_active {
            // A lazily-starting bundle never ran its activator
            pending.activator = None;
        }
        Ok(Some(pending))
    }

    /// Teardown always completes; an activator stop error is returned after
    /// the bundle is back in RESOLVED
    fn finish_stop(
        &self,
        core: &mut Core,
        id: BundleId,
        outcome: anyhow::Result<()>,
        events: &mut Vec<BundleEvent>,
    ) -> Result<()> {
        core.bundle_mut(id)?.state = BundleState::Resolved;
        core.start_order.retain(|&b| b != id);
        events.push(BundleEvent::new(id, BundleEventKind::Stopped));
        info!(bundle = %id, "bundle stopped");
        match outcome {
            Ok(()) => Ok(()),
            Err(source) => {
                self.framework_error(Some(id), format!("activator stop failed: {}", source));
                Err(Error::Activation { bundle: id, source })
            }
        }
    }

    // ------------------------------------------------------------------
    // update / uninstall

    /// Replace a bundle's content with a new generation
    ///
    /// An active bundle is stopped first and restarted afterwards. The old
    /// generation is purged when nothing depends on it; otherwise its
    /// exports turn zombie and it lingers until an external refresh.
    pub fn update(&self, id: BundleId, manifest: BundleManifest) -> Result<()> {
        manifest.validate()?;
        let mut events = Vec::new();

        // Stop phase, under the Updating guard
        let staged = {
            let mut core = self.core.lock();
            self.begin(&mut core, id, Operation::Updating, LONG_WAIT)?;
            let state = core.bundle(id).map(|b| b.state);
            match state {
                Err(err) => {
                    self.end(&mut core, id);
                    Err(err)
                }
                Ok(BundleState::Uninstalled) => {
                    self.end(&mut core, id);
                    Err(Error::IllegalState {
                        bundle: id,
                        state: BundleState::Uninstalled.to_string(),
                        action: "update",
                    })
                }
                Ok(state) => {
                    if state.is_running() {
                        match self.prepare_stop(&mut core, id, true, &mut events) {
                            Ok(pending) => Ok((true, pending)),
                            Err(err) => {
                                self.end(&mut core, id);
                                Err(err)
                            }
                        }
                    } else {
                        Ok((false, None))
                    }
                }
            }
        };
        self.dispatch(std::mem::take(&mut events));
        let (was_running, pending) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                self.cond.notify_all();
                return Err(err);
            }
        };

        if let Some(pending) = pending {
            let outcome = match &pending.activator {
                Some(activator) => activator.stop(&pending.ctx),
                None => Ok(()),
            };
            let mut core = self.core.lock();
            if let Err(err) = self.finish_stop(&mut core, id, outcome, &mut events) {
                // Teardown completed; surface the activator error and keep
                // updating
                drop(core);
                self.framework_error(Some(id), err.to_string());
            }
        }

        // Swap phase
        let location = {
            let mut core = self.core.lock();
            let result = self.swap_generation(&mut core, id, manifest.clone(), &mut events);
            self.end(&mut core, id);
            match result {
                Ok(location) => location,
                Err(err) => {
                    drop(core);
                    self.cond.notify_all();
                    self.dispatch(std::mem::take(&mut events));
                    return Err(err);
                }
            }
        };
        self.cond.notify_all();
        self.dispatch(std::mem::take(&mut events));

        let generation = self.core.lock().bundle(id)?.generation_count;
        self.persist_record(id, &location, generation, &manifest);

        if was_running {
            if let Err(err) = self.start(id, StartOptions::transient()) {
                self.framework_error(Some(id), format!("restart after update failed: {}", err));
            }
        }
        Ok(())
    }

    fn swap_generation(
        &self,
        core: &mut Core,
        id: BundleId,
        manifest: BundleManifest,
        events: &mut Vec<BundleEvent>,
    ) -> Result<String> {
        let old = core.bundle(id)?.current;
        self.retire_generation(core, id, old, events);

        let number = core.bundle(id)?.generation_count + 1;
        let new = core.store.insert(id, number, manifest);
        if !core.store.get(new).is_fragment() {
            core.graph.register(&core.store, new);
        }
        let bundle = core.bundle_mut(id)?;
        bundle.current = new;
        bundle.generation_count = number;
        bundle.state = BundleState::Installed;
        bundle.failure = None;
        let location = bundle.location.clone();
        core.epoch += 1;
        events.push(BundleEvent::new(id, BundleEventKind::Updated));
        info!(bundle = %id, generation = number, "bundle updated");
        Ok(location)
    }

    /// Take one generation out of service: purge it when nothing depends on
    /// it, otherwise leave it behind as a zombie
    fn retire_generation(
        &self,
        core: &mut Core,
        id: BundleId,
        generation: GenerationId,
        events: &mut Vec<BundleEvent>,
    ) {
        let fragments = core.store.get(generation).fragments.clone();
        if core.graph.unregister(&core.store, generation, false) {
            for fragment in fragments {
                core.store.detach_fragment(generation, fragment);
                self.release_fragment(core, fragment, events);
            }
            self.drop_require_backrefs(core, generation);
            core.store.purge(generation);
            debug!(bundle = %id, generation = %generation, "old generation purged");
        } else {
            let retained = core.store.get_mut(generation);
            for export in &mut retained.exports {
                export.zombie = true;
            }
            if let Some(bundle) = core.bundles.get_mut(&id) {
                bundle.retired.push(generation);
            }
            debug!(bundle = %id, generation = %generation, "old generation retained as zombie");
        }
    }

    /// Return a just-detached fragment's bundle to INSTALLED
    fn release_fragment(&self, core: &mut Core, fragment: GenerationId, events: &mut Vec<BundleEvent>) {
        let frag_bundle = core.store.get(fragment).bundle_id;
        core.store.get_mut(fragment).resolved = false;
        if let Some(bundle) = core.bundles.get_mut(&frag_bundle) {
            if bundle.state == BundleState::Resolved {
                bundle.state = BundleState::Installed;
                events.push(BundleEvent::new(frag_bundle, BundleEventKind::Unresolved));
            }
        }
    }

    /// Drop `required_by` back-references this generation holds on its
    /// providers before it disappears
    fn drop_require_backrefs(&self, core: &mut Core, generation: GenerationId) {
        let providers: Vec<GenerationId> = core
            .store
            .get(generation)
            .requires
            .iter()
            .filter_map(|r| r.provider)
            .collect();
        for provider in providers {
            if core.store.contains(provider) {
                core.store.get_mut(provider).required_by.retain(|&g| g != generation);
            }
        }
    }

    /// Remove a bundle permanently. The bundle record survives in the
    /// terminal UNINSTALLED state; its generation is purged immediately when
    /// nothing depends on it, or lingers as a zombie until refresh.
    pub fn uninstall(&self, id: BundleId) -> Result<()> {
        let mut events = Vec::new();

        let staged = {
            let mut core = self.core.lock();
            self.begin(&mut core, id, Operation::Uninstalling, LONG_WAIT)?;
            let state = core.bundle(id).map(|b| b.state);
            match state {
                Err(err) => {
                    self.end(&mut core, id);
                    Err(err)
                }
                Ok(BundleState::Uninstalled) => {
                    self.end(&mut core, id);
                    Err(Error::IllegalState {
                        bundle: id,
                        state: BundleState::Uninstalled.to_string(),
                        action: "uninstall",
                    })
                }
                Ok(state) if state.is_running() => {
                    match self.prepare_stop(&mut core, id, true, &mut events) {
                        Ok(pending) => Ok(pending),
                        Err(err) => {
                            self.end(&mut core, id);
                            Err(err)
                        }
                    }
                }
                Ok(_) => Ok(None),
            }
        };
        self.dispatch(std::mem::take(&mut events));
        let pending = match staged {
            Ok(pending) => pending,
            Err(err) => {
                self.cond.notify_all();
                return Err(err);
            }
        };

        if let Some(pending) = pending {
            let outcome = match &pending.activator {
                Some(activator) => activator.stop(&pending.ctx),
                None => Ok(()),
            };
            let mut core = self.core.lock();
            if let Err(err) = self.finish_stop(&mut core, id, outcome, &mut events) {
                drop(core);
                self.framework_error(Some(id), err.to_string());
            }
        }

        {
            let mut core = self.core.lock();
            self.remove_bundle(&mut core, id, &mut events);
            self.end(&mut core, id);
        }
        self.cond.notify_all();
        self.dispatch(events);
        self.persist_delete(id);
        Ok(())
    }

    fn remove_bundle(&self, core: &mut Core, id: BundleId, events: &mut Vec<BundleEvent>) {
        let Ok(bundle) = core.bundle(id) else { return };
        let generation = bundle.current;

        let current_gen = core.store.get(generation);
        if current_gen.is_fragment() && current_gen.host.is_some() {
            let host = current_gen.host.unwrap_or(generation);
            if core.store.get(host).resolved {
                // The host keeps the contribution until refresh; flag it so
                // the zombie closure finds the host
                core.store.get_mut(generation).uninstalled = true;
                let host_gen = core.store.get_mut(host);
                for export in &mut host_gen.exports {
                    if export.from_fragment == Some(generation) {
                        export.zombie = true;
                    }
                }
            } else {
                core.store.detach_fragment(host, generation);
                core.graph.resync(&core.store, host);
                core.store.purge(generation);
            }
        } else if core.graph.unregister(&core.store, generation, false) {
            let fragments = core.store.get(generation).fragments.clone();
            for fragment in fragments {
                core.store.detach_fragment(generation, fragment);
                self.release_fragment(core, fragment, events);
            }
            self.drop_require_backrefs(core, generation);
            core.store.purge(generation);
        } else {
            let generation = core.store.get_mut(generation);
            generation.uninstalled = true;
            for export in &mut generation.exports {
                export.zombie = true;
            }
        }

        if let Some(bundle) = core.bundles.get_mut(&id) {
            bundle.state = BundleState::Uninstalled;
        }
        core.start_order.retain(|&b| b != id);
        core.activators.remove(&id);
        core.epoch += 1;
        events.push(BundleEvent::new(id, BundleEventKind::Uninstalled));
        info!(bundle = %id, "bundle uninstalled");
    }

    // ------------------------------------------------------------------
    // refresh / shutdown

    /// Tear down and rebuild the zombie-affected closure
    ///
    /// An empty seed refreshes everything touched by any zombie export.
    /// Affected active bundles stop in reverse start order, drop to
    /// INSTALLED, their zombie generations are purged, and the previously
    /// active ones restart.
    pub fn refresh(&self, seed: &[BundleId]) -> Result<()> {
        let (affected, to_stop) = {
            let core = self.core.lock();
            let affected = core.graph.zombie_affected(&core.store, seed);
            let to_stop: Vec<BundleId> = core
                .start_order
                .iter()
                .rev()
                .copied()
                .filter(|b| affected.contains(b))
                .filter(|b| {
                    core.bundles
                        .get(b)
                        .is_some_and(|bundle| bundle.state.is_running())
                })
                .collect();
            (affected, to_stop)
        };
        if affected.is_empty() {
            return Ok(());
        }
        debug!(count = affected.len(), "refreshing zombie-affected closure");

        for &id in &to_stop {
            if let Err(err) = self.stop_with(id, true) {
                self.framework_error(Some(id), format!("stop during refresh failed: {}", err));
            }
        }

        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            let mut unresolved: HashSet<GenerationId> = HashSet::new();

            for &id in &affected {
                let Some(bundle) = core.bundles.get(&id) else {
                    continue;
                };
                let generation = bundle.current;
                let uninstalled = bundle.state == BundleState::Uninstalled;
                let retired = bundle.retired.clone();
                if !core.store.contains(generation) {
                    // Already torn down earlier in this pass, as a fragment
                    // of a processed host
                    continue;
                }

                if uninstalled {
                    // Final teardown of an uninstalled zombie
                    let fragments = core.store.get(generation).fragments.clone();
                    for fragment in fragments {
                        core.store.detach_fragment(generation, fragment);
                        self.release_fragment(&mut core, fragment, &mut events);
                    }
                    if core.store.get(generation).is_fragment() {
                        if let Some(host) = core.store.get(generation).host {
                            core.store.detach_fragment(host, generation);
                            let Core {
                                ref store,
                                ref mut graph,
                                ..
                            } = *core;
                            graph.resync(store, host);
                        }
                    }
                    unresolved.insert(generation);
                    {
                        let Core {
                            ref store,
                            ref mut graph,
                            ..
                        } = *core;
                        graph.unregister(store, generation, true);
                    }
                    self.drop_require_backrefs(&mut core, generation);
                    core.store.purge(generation);
                } else {
                    // Uninstalled fragments attached here go away for good
                    let fragments = core.store.get(generation).fragments.clone();
                    for fragment in fragments {
                        if core.store.get(fragment).uninstalled {
                            core.store.detach_fragment(generation, fragment);
                            core.store.purge(fragment);
                        } else {
                            core.store.get_mut(fragment).resolved = false;
                            let frag_bundle = core.store.get(fragment).bundle_id;
                            if let Some(b) = core.bundles.get_mut(&frag_bundle) {
                                if b.state == BundleState::Resolved {
                                    b.state = BundleState::Installed;
                                    events.push(BundleEvent::new(
                                        frag_bundle,
                                        BundleEventKind::Unresolved,
                                    ));
                                }
                            }
                        }
                    }

                    let was_resolved = core.store.get(generation).resolved;
                    unresolved.insert(generation);
                    for export in &mut core.store.get_mut(generation).exports {
                        export.zombie = false;
                    }
                    core.store.get_mut(generation).unresolve();
                    let Core {
                        ref store,
                        ref mut graph,
                        ..
                    } = *core;
                    graph.resync(store, generation);

                    if let Some(bundle) = core.bundles.get_mut(&id) {
                        bundle.failure = None;
                        if was_resolved && bundle.state != BundleState::Installed {
                            bundle.state = BundleState::Installed;
                            events.push(BundleEvent::new(id, BundleEventKind::Unresolved));
                        }
                    }
                }

                // Retired zombie generations die with the refresh
                for old in retired {
                    unresolved.insert(old);
                    {
                        let Core {
                            ref store,
                            ref mut graph,
                            ..
                        } = *core;
                        graph.unregister(store, old, true);
                    }
                    self.drop_require_backrefs(&mut core, old);
                    core.store.purge(old);
                }
                if let Some(bundle) = core.bundles.get_mut(&id) {
                    bundle.retired.clear();
                }
            }

            // Providers outside the closure may still hold back-references
            // to generations that just unresolved
            let live: Vec<GenerationId> = core.store.iter().map(|g| g.id).collect();
            for g in live {
                core.store
                    .get_mut(g)
                    .required_by
                    .retain(|r| !unresolved.contains(r));
            }
            core.epoch += 1;
        }
        self.cond.notify_all();
        self.dispatch(events);

        for &id in to_stop.iter().rev() {
            let installed = self
                .core
                .lock()
                .bundles
                .get(&id)
                .is_some_and(|b| b.state != BundleState::Uninstalled);
            if !installed {
                continue;
            }
            if let Err(err) = self.start(id, StartOptions::transient()) {
                self.framework_error(Some(id), format!("restart after refresh failed: {}", err));
            }
        }
        Ok(())
    }

    /// Stop every active bundle in reverse start order
    pub fn shutdown(&self) {
        let order: Vec<BundleId> = {
            let core = self.core.lock();
            core.start_order.iter().rev().copied().collect()
        };
        info!(count = order.len(), "runtime shutdown");
        for id in order {
            if let Err(err) = self.stop_with(id, true) {
                self.framework_error(Some(id), format!("stop during shutdown failed: {}", err));
            }
        }
    }

    // ------------------------------------------------------------------
    // queries and loader integration

    pub fn state(&self, id: BundleId) -> Result<BundleState> {
        Ok(self.core.lock().bundle(id)?.state)
    }

    pub fn location(&self, id: BundleId) -> Result<String> {
        Ok(self.core.lock().bundle(id)?.location.clone())
    }

    pub fn bundles(&self) -> Vec<BundleId> {
        self.core.lock().bundles.keys().copied().collect()
    }

    /// Lowest-id bundle whose current generation carries this symbolic name
    pub fn find_bundle(&self, symbolic_name: &str) -> Option<BundleId> {
        let core = self.core.lock();
        core.bundles
            .values()
            .filter(|b| b.state != BundleState::Uninstalled)
            .find(|b| core.store.get(b.current).symbolic_name() == Some(symbolic_name))
            .map(|b| b.id)
    }

    /// Committed provider bundle for a package import of `id`, if wired
    pub fn wired_provider(&self, id: BundleId, package: &str) -> Result<Option<BundleId>> {
        let core = self.core.lock();
        let current = core.bundle(id)?.current;
        if !core.store.contains(current) {
            return Ok(None);
        }
        let generation = core.store.get(current);
        Ok(generation
            .imports
            .iter()
            .filter(|i| i.spec.package == package)
            .find_map(|i| i.provider)
            .map(|e| core.store.get(e.generation).bundle_id))
    }

    /// Answer a loader delegation query for a resolved bundle
    ///
    /// A wired import delegates to its provider. A package with no wire but
    /// a covering dynamic import declaration gets resolved on the spot;
    /// failure falls back to a local search. This call also fires lazy
    /// activation when the looked-up package triggers it.
    pub fn resolve_lookup(&self, id: BundleId, lookup: &Lookup) -> Result<Delegation> {
        let Some(package) = lookup.package() else {
            return Ok(Delegation::Local);
        };

        let needs_dynamic = {
            let core = self.core.lock();
            let bundle = core.bundle(id)?;
            if !core.store.contains(bundle.current) {
                return Err(Error::IllegalState {
                    bundle: id,
                    state: bundle.state.to_string(),
                    action: "delegate lookups",
                });
            }
            let generation = core.store.get(bundle.current);
            if !generation.resolved {
                return Err(Error::IllegalState {
                    bundle: id,
                    state: bundle.state.to_string(),
                    action: "delegate lookups",
                });
            }

            if let Some(provider) = generation
                .imports
                .iter()
                .filter(|i| i.spec.package == package)
                .find_map(|i| i.provider)
            {
                let handle = core.store.get(provider.generation).loader_handle;
                return Ok(match handle {
                    Some(loader_handle) => Delegation::Wire { loader_handle },
                    None => Delegation::Local,
                });
            }
            if generation
                .exports
                .iter()
                .any(|e| e.spec.package == package && !e.zombie)
            {
                return Ok(Delegation::Local);
            }
            if let Some(export) = generation
                .reexports
                .iter()
                .find(|&&e| {
                    core.store.contains(e.generation)
                        && core.store.export(e).spec.package == package
                        && !core.store.export(e).zombie
                })
                .copied()
            {
                let handle = core.store.get(export.generation).loader_handle;
                return Ok(match handle {
                    Some(loader_handle) => Delegation::Wire { loader_handle },
                    None => Delegation::Local,
                });
            }
            // Require-Bundle wires expose the provider's own exports and
            // whatever the provider reexports, but nothing further
            let required: Vec<GenerationId> = generation
                .requires
                .iter()
                .filter_map(|r| r.provider)
                .filter(|&p| core.store.contains(p))
                .collect();
            for provider in required {
                let provider_gen = core.store.get(provider);
                if provider_gen
                    .exports
                    .iter()
                    .any(|e| e.spec.package == package && !e.zombie)
                {
                    let handle = provider_gen.loader_handle;
                    return Ok(match handle {
                        Some(loader_handle) => Delegation::Wire { loader_handle },
                        None => Delegation::Local,
                    });
                }
                if let Some(export) = provider_gen
                    .reexports
                    .iter()
                    .find(|&&e| {
                        core.store.contains(e.generation)
                            && core.store.export(e).spec.package == package
                            && !core.store.export(e).zombie
                    })
                    .copied()
                {
                    let handle = core.store.get(export.generation).loader_handle;
                    return Ok(match handle {
                        Some(loader_handle) => Delegation::Wire { loader_handle },
                        None => Delegation::Local,
                    });
                }
            }
            generation.imports
                .iter()
                .any(|i| i.spec.mode == ImportMode::Dynamic)
        };

        if needs_dynamic {
            let wired = {
                let mut core = self.core.lock();
                let target = core.bundle(id)?.current;
                let Core {
                    ref mut store,
                    ref mut graph,
                    ..
                } = *core;
                resolver::resolve_dynamic(store, graph, self.policy.as_ref(), target, &package)
            };
            if let Ok(export) = wired {
                let handle = self.core.lock().store.get(export.generation).loader_handle;
                let _ = self.trigger_lazy_activation(id, &package);
                if let Some(loader_handle) = handle {
                    return Ok(Delegation::Wire { loader_handle });
                }
            }
        }

        let _ = self.trigger_lazy_activation(id, &package);
        Ok(Delegation::Local)
    }

    // ------------------------------------------------------------------
    // plumbing

    /// Take the per-bundle operation guard, waiting up to `limit` for an
    /// in-flight transition to finish
    fn begin(
        &self,
        core: &mut MutexGuard<'_, Core>,
        id: BundleId,
        op: Operation,
        limit: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            let bundle = core.bundles.get_mut(&id).ok_or(Error::NoSuchBundle(id))?;
            if bundle.operation == Operation::Idle {
                bundle.operation = op;
                return Ok(());
            }
            let pending = bundle.operation;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::StateChange {
                    bundle: id,
                    operation: pending.to_string(),
                });
            }
            self.cond.wait_for(core, deadline - now);
        }
    }

    fn end(&self, core: &mut Core, id: BundleId) {
        if let Some(bundle) = core.bundles.get_mut(&id) {
            bundle.operation = Operation::Idle;
        }
    }

    fn dispatch(&self, events: Vec<BundleEvent>) {
        if events.is_empty() {
            return;
        }
        self.dispatcher.lock().dispatch(&events);
    }

    fn framework_error(&self, bundle: Option<BundleId>, message: String) {
        self.dispatcher
            .lock()
            .dispatch_error(&FrameworkError::new(bundle, message));
    }

    fn persist_record(&self, id: BundleId, location: &str, generation: u32, manifest: &BundleManifest) {
        let Some(store) = self.persist.as_ref() else { return };
        let record = StoredBundle {
            id,
            location: location.to_string(),
            generation,
            manifest: manifest.clone(),
            autostart: false,
            start_level: 1,
            installed_at: Utc::now(),
        };
        if let Err(err) = store.save_bundle(&record) {
            warn!(bundle = %id, error = %err, "bundle persistence failed");
            self.framework_error(Some(id), format!("persistence failed: {}", err));
        }
    }

    fn persist_autostart(&self, id: BundleId, autostart: bool) {
        let Some(store) = self.persist.as_ref() else { return };
        if let Err(err) = store.set_autostart(id, autostart) {
            warn!(bundle = %id, error = %err, "autostart persistence failed");
        }
    }

    fn persist_delete(&self, id: BundleId) {
        let Some(store) = self.persist.as_ref() else { return };
        if let Err(err) = store.delete_bundle(id) {
            warn!(bundle = %id, error = %err, "bundle delete persistence failed");
        }
    }
}
