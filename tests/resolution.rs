// tests/resolution.rs

//! End-to-end resolution scenarios through the runtime facade.
//!
//! These tests verify that:
//! 1. Resolution cascades atomically: one resolve pulls a whole dependency
//!    chain to RESOLVED, or nothing changes
//! 2. The uses-consistency check prevents two providers of one package
//!    from becoming visible to the same bundle
//! 3. Singleton conflicts name the already-resolved blocker
//! 4. Dynamic imports bind lazily with first-bind-wins semantics

use ferrule::{
    BundleManifest, BundleState, Delegation, Error, ExportSpec, ImportSpec, Lookup, ModuleRuntime,
    RequireSpec,
};

fn manifest(name: &str, version: &str) -> BundleManifest {
    BundleManifest::named(name, version).unwrap()
}

#[test]
fn test_resolution_cascade_is_atomic() {
    let rt = ModuleRuntime::new();
    let base = rt
        .install(
            "loc://base",
            manifest("base", "1.0").export(ExportSpec::new("base.api", "1.0")),
        )
        .unwrap();
    let middle = rt
        .install(
            "loc://middle",
            manifest("middle", "1.0")
                .export(ExportSpec::new("middle.api", "1.0"))
                .import(ImportSpec::new("base.api", "[1.0,2.0)")),
        )
        .unwrap();
    let top = rt
        .install(
            "loc://top",
            manifest("top", "1.0").import(ImportSpec::new("middle.api", "")),
        )
        .unwrap();

    // One call resolves the whole chain
    rt.resolve(top).unwrap();
    assert_eq!(rt.state(base).unwrap(), BundleState::Resolved);
    assert_eq!(rt.state(middle).unwrap(), BundleState::Resolved);
    assert_eq!(rt.state(top).unwrap(), BundleState::Resolved);
    assert_eq!(rt.wired_provider(middle, "base.api").unwrap(), Some(base));
    assert_eq!(rt.wired_provider(top, "middle.api").unwrap(), Some(middle));
}

#[test]
fn test_failed_cascade_changes_nothing() {
    let rt = ModuleRuntime::new();
    // middle itself needs a package nobody exports
    let middle = rt
        .install(
            "loc://middle",
            manifest("middle", "1.0")
                .export(ExportSpec::new("middle.api", "1.0"))
                .import(ImportSpec::new("ghost", "")),
        )
        .unwrap();
    let top = rt
        .install(
            "loc://top",
            manifest("top", "1.0").import(ImportSpec::new("middle.api", "")),
        )
        .unwrap();

    let err = rt.resolve(top).unwrap_err();
    assert!(matches!(err, Error::Resolution { .. }));
    assert_eq!(rt.state(middle).unwrap(), BundleState::Installed);
    assert_eq!(rt.state(top).unwrap(), BundleState::Installed);
    assert_eq!(rt.wired_provider(top, "middle.api").unwrap(), None);
}

#[test]
fn test_uses_consistency_blocks_mixed_providers() {
    // util is exported twice. api's implementation uses util and is wired
    // to the first exporter; a client pinning util to the second exporter
    // must not also see api.
    let rt = ModuleRuntime::new();
    let util1 = rt
        .install(
            "loc://util1",
            manifest("util1", "1.0").export(ExportSpec::new("util", "1.0")),
        )
        .unwrap();
    rt.install(
        "loc://util2",
        manifest("util2", "1.0").export(ExportSpec::new("util", "1.0")),
    )
    .unwrap();
    let api = rt
        .install(
            "loc://api",
            manifest("api", "1.0")
                .export(ExportSpec::new("api", "1.0").with_uses(&["util"]))
                .import(ImportSpec::new("util", "")),
        )
        .unwrap();
    rt.resolve(api).unwrap();
    assert_eq!(rt.wired_provider(api, "util").unwrap(), Some(util1));

    let client = rt
        .install(
            "loc://client",
            manifest("client", "1.0")
                .import(ImportSpec::new("api", ""))
                .import(ImportSpec::new("util", "").from_bundle("util2")),
        )
        .unwrap();
    let err = rt.resolve(client).unwrap_err();
    assert!(err.to_string().contains("api"), "{}", err);
    assert_eq!(rt.state(client).unwrap(), BundleState::Installed);
}

#[test]
fn test_uses_consistency_accepts_shared_provider() {
    let rt = ModuleRuntime::new();
    let util = rt
        .install(
            "loc://util",
            manifest("util", "1.0").export(ExportSpec::new("util", "1.0")),
        )
        .unwrap();
    let api = rt
        .install(
            "loc://api",
            manifest("api", "1.0")
                .export(ExportSpec::new("api", "1.0").with_uses(&["util"]))
                .import(ImportSpec::new("util", "")),
        )
        .unwrap();
    let client = rt
        .install(
            "loc://client",
            manifest("client", "1.0")
                .import(ImportSpec::new("api", ""))
                .import(ImportSpec::new("util", "")),
        )
        .unwrap();

    rt.resolve(client).unwrap();
    assert_eq!(rt.wired_provider(client, "api").unwrap(), Some(api));
    assert_eq!(rt.wired_provider(client, "util").unwrap(), Some(util));
    assert_eq!(rt.wired_provider(api, "util").unwrap(), Some(util));
}

#[test]
fn test_singleton_conflict_names_blocker() {
    let rt = ModuleRuntime::new();
    let v1 = rt
        .install("loc://v1", manifest("framework.ext", "1.2").singleton())
        .unwrap();
    let v2 = rt
        .install("loc://v2", manifest("framework.ext", "2.0").singleton())
        .unwrap();

    rt.resolve(v1).unwrap();
    let err = rt.resolve(v2).unwrap_err();
    match err {
        Error::SingletonConflict {
            symbolic_name,
            blocker,
        } => {
            assert_eq!(symbolic_name, "framework.ext");
            assert_eq!(blocker, "framework.ext:1.2.0");
        }
        other => panic!("expected singleton conflict, got {}", other),
    }
    assert_eq!(rt.state(v2).unwrap(), BundleState::Installed);
}

#[test]
fn test_require_bundle_chain_with_reexport() {
    let rt = ModuleRuntime::new();
    let base = rt
        .install(
            "loc://base",
            manifest("base", "1.0").export(ExportSpec::new("base.api", "1.0")),
        )
        .unwrap();
    let middle = rt
        .install(
            "loc://middle",
            manifest("middle", "1.0").require(RequireSpec::new("base", "[1.0,2.0)").reexport()),
        )
        .unwrap();
    let top = rt
        .install(
            "loc://top",
            manifest("top", "1.0").require(RequireSpec::new("middle", "")),
        )
        .unwrap();

    rt.resolve(top).unwrap();
    assert_eq!(rt.state(base).unwrap(), BundleState::Resolved);
    assert_eq!(rt.state(middle).unwrap(), BundleState::Resolved);

    // Through the reexport, top can answer lookups in base.api via middle's
    // visible surface
    let delegation = rt
        .resolve_lookup(middle, &Lookup::class("base.api.Service"))
        .unwrap();
    assert!(matches!(delegation, Delegation::Wire { .. }));
}

#[test]
fn test_dynamic_import_first_bind_wins() {
    let rt = ModuleRuntime::new();
    let p1 = rt
        .install(
            "loc://p1",
            manifest("p1", "1.0").export(ExportSpec::new("plugin.spi", "1.0")),
        )
        .unwrap();
    rt.install(
        "loc://p2",
        manifest("p2", "1.0").export(ExportSpec::new("plugin.spi", "1.0")),
    )
    .unwrap();
    let host = rt
        .install(
            "loc://host",
            manifest("host", "1.0").import(ImportSpec::new("plugin.*", "").dynamic()),
        )
        .unwrap();
    let _ = rt.resolve(p1);
    rt.resolve(host).unwrap();
    assert_eq!(rt.wired_provider(host, "plugin.spi").unwrap(), None);

    // First lookup binds; repeated lookups keep the same wire
    let first = rt
        .resolve_lookup(host, &Lookup::class("plugin.spi.Extension"))
        .unwrap();
    assert!(matches!(first, Delegation::Wire { .. }));
    assert_eq!(rt.wired_provider(host, "plugin.spi").unwrap(), Some(p1));
    let second = rt
        .resolve_lookup(host, &Lookup::class("plugin.spi.Extension"))
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_optional_import_resolves_without_provider() {
    let rt = ModuleRuntime::new();
    let id = rt
        .install(
            "loc://a",
            manifest("a", "1.0").import(ImportSpec::new("maybe", "").optional()),
        )
        .unwrap();
    rt.resolve(id).unwrap();
    assert_eq!(rt.state(id).unwrap(), BundleState::Resolved);
    assert_eq!(rt.wired_provider(id, "maybe").unwrap(), None);
}

#[test]
fn test_version_range_selects_matching_export() {
    let rt = ModuleRuntime::new();
    rt.install(
        "loc://old",
        manifest("old", "1.0").export(ExportSpec::new("p", "1.4.0")),
    )
    .unwrap();
    let new = rt
        .install(
            "loc://new",
            manifest("new", "1.0").export(ExportSpec::new("p", "2.1.0")),
        )
        .unwrap();
    let picky = rt
        .install(
            "loc://picky",
            manifest("picky", "1.0").import(ImportSpec::new("p", "[2.0,3.0)")),
        )
        .unwrap();

    rt.resolve(picky).unwrap();
    assert_eq!(rt.wired_provider(picky, "p").unwrap(), Some(new));
}
