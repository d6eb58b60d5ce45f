// src/policy.rs

//! Permission oracle consulted during resolution
//!
//! The resolver asks before every candidate wire whether the bundles on
//! both ends are allowed to participate. Implementations answer from
//! whatever security model the embedder runs; the runtime ships with
//! [`AllowAll`] for embeddings without one.

use crate::bundle::BundleId;

/// Answers permission questions for candidate wires
///
/// Every method is consulted inside the resolution transaction, so answers
/// must be stable for the duration of one resolve call.
pub trait Policy: Send + Sync {
    /// May `importer` import `package` from `exporter`?
    fn may_import(&self, importer: BundleId, package: &str, exporter: BundleId) -> bool;

    /// May `exporter` offer `package` at all?
    fn may_export(&self, exporter: BundleId, package: &str) -> bool;

    /// May `requirer` take a Require-Bundle wire to `provider`?
    fn may_require(&self, requirer: BundleId, provider: BundleId) -> bool;

    /// May `fragment` attach to `host`?
    fn may_attach(&self, fragment: BundleId, host: BundleId) -> bool;
}

/// The default oracle: everything is permitted
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn may_import(&self, _importer: BundleId, _package: &str, _exporter: BundleId) -> bool {
        true
    }

    fn may_export(&self, _exporter: BundleId, _package: &str) -> bool {
        true
    }

    fn may_require(&self, _requirer: BundleId, _provider: BundleId) -> bool {
        true
    }

    fn may_attach(&self, _fragment: BundleId, _host: BundleId) -> bool {
        true
    }
}
