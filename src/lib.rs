// src/lib.rs

//! Ferrule Module Runtime
//!
//! Dynamic module runtime with live dependency resolution, atomic wiring
//! commits, and an explicit bundle lifecycle.
//!
//! # Architecture
//!
//! - Generations: every bundle revision is an arena entry with integer ids,
//!   so superseded code can linger as a zombie without pointer cycles
//! - Package graph: one global name-to-exporters index the resolver scans
//!   in declaration order
//! - Transactions: resolution happens in a scratch workspace and commits
//!   all-or-nothing; a failed attempt leaves the graph untouched
//! - Lifecycle: INSTALLED through ACTIVE and back, guarded per bundle by
//!   an advisory operation marker with bounded waits
//! - Loader seam: the runtime answers delegation queries; it never loads
//!   code itself

pub mod bundle;
mod error;
pub mod events;
pub mod graph;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod policy;
pub mod resolver;
pub mod storage;
pub mod version;

pub use bundle::{Bundle, BundleGeneration, BundleId, ExportId, GenerationId, Generations};
pub use error::{Error, Result};
pub use events::{BundleEvent, BundleEventKind, EventListener, FrameworkError};
pub use graph::PackageGraph;
pub use lifecycle::{
    BundleActivator, BundleContext, BundleState, ModuleRuntime, Operation, StartOptions,
};
pub use loader::{Delegation, Lookup};
pub use manifest::{
    BundleManifest, ExportSpec, FragmentAttachment, ImportMode, ImportSpec, LazyActivation,
    RequireMode, RequireSpec, Visibility,
};
pub use policy::{AllowAll, Policy};
pub use resolver::{resolve_bundle, resolve_dynamic, ResolutionReport};
pub use storage::{BundleStore, SqliteStore, StoredBundle};
pub use version::{BundleVersion, VersionRange};
