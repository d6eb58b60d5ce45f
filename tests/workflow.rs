// tests/workflow.rs

//! Full lifecycle workflows: install, start, update, refresh, uninstall.
//!
//! These tests verify that:
//! 1. Updates keep dependents running against the zombie generation until
//!    an explicit refresh rewires them
//! 2. Fragments attach, resolve with their host, and block nothing when
//!    detached by the resolver's retry loop
//! 3. Shutdown stops bundles in reverse start order
//! 4. Runtime state survives a restart through the SQLite store

use ferrule::lifecycle::{BundleActivator, BundleContext, StartOptions};
use ferrule::{
    BundleManifest, BundleState, ExportSpec, ImportSpec, ModuleRuntime, SqliteStore,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn manifest(name: &str, version: &str) -> BundleManifest {
    BundleManifest::named(name, version).unwrap()
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl BundleActivator for Recorder {
    fn start(&self, ctx: &BundleContext) -> anyhow::Result<()> {
        self.calls.lock().push(format!("start {}", ctx));
        Ok(())
    }

    fn stop(&self, ctx: &BundleContext) -> anyhow::Result<()> {
        self.calls.lock().push(format!("stop {}", ctx));
        Ok(())
    }
}

#[test]
fn test_update_zombie_survives_until_refresh() {
    let rt = ModuleRuntime::new();
    let provider = rt
        .install(
            "loc://provider",
            manifest("provider", "1.0").export(ExportSpec::new("svc", "1.0")),
        )
        .unwrap();
    let consumer = rt
        .install(
            "loc://consumer",
            manifest("consumer", "1.0").import(ImportSpec::new("svc", "[1.0,2.0)")),
        )
        .unwrap();
    rt.resolve(consumer).unwrap();

    // The old generation is depended on, so it lingers as a zombie
    rt.update(
        provider,
        manifest("provider", "2.0").export(ExportSpec::new("svc", "2.0")),
    )
    .unwrap();
    assert_eq!(rt.state(provider).unwrap(), BundleState::Installed);
    assert_eq!(rt.state(consumer).unwrap(), BundleState::Resolved);
    assert_eq!(rt.wired_provider(consumer, "svc").unwrap(), Some(provider));

    // Refresh tears the zombie down; the consumer's range excludes 2.0
    rt.refresh(&[provider]).unwrap();
    assert_eq!(rt.state(consumer).unwrap(), BundleState::Installed);
    assert!(rt.resolve(consumer).is_err());
}

#[test]
fn test_two_updates_stack_zombies() {
    let rt = ModuleRuntime::new();
    let provider = rt
        .install(
            "loc://provider",
            manifest("provider", "1.0").export(ExportSpec::new("svc", "1.0")),
        )
        .unwrap();
    let c1 = rt
        .install(
            "loc://c1",
            manifest("c1", "1.0").import(ImportSpec::new("svc", "[1.0,1.1)")),
        )
        .unwrap();
    rt.resolve(c1).unwrap();

    rt.update(
        provider,
        manifest("provider", "1.5").export(ExportSpec::new("svc", "1.5")),
    )
    .unwrap();
    let c2 = rt
        .install(
            "loc://c2",
            manifest("c2", "1.0").import(ImportSpec::new("svc", "[1.5,1.6)")),
        )
        .unwrap();
    rt.resolve(c2).unwrap();

    rt.update(
        provider,
        manifest("provider", "2.0").export(ExportSpec::new("svc", "2.0")),
    )
    .unwrap();

    // Both old generations linger, each pinning its own consumer
    assert_eq!(rt.wired_provider(c1, "svc").unwrap(), Some(provider));
    assert_eq!(rt.wired_provider(c2, "svc").unwrap(), Some(provider));
    assert_eq!(rt.state(c1).unwrap(), BundleState::Resolved);
    assert_eq!(rt.state(c2).unwrap(), BundleState::Resolved);

    rt.refresh(&[]).unwrap();
    assert_eq!(rt.state(c1).unwrap(), BundleState::Installed);
    assert_eq!(rt.state(c2).unwrap(), BundleState::Installed);
}

#[test]
fn test_fragment_workflow() {
    let rt = ModuleRuntime::new();
    let host = rt.install("loc://host", manifest("host", "1.0")).unwrap();
    let translations = rt
        .install(
            "loc://nls",
            manifest("host.nls", "1.0")
                .fragment_of("host", "[1.0,2.0)")
                .unwrap()
                .export(ExportSpec::new("host.messages", "1.0")),
        )
        .unwrap();

    // Resolving the host picks up the installed fragment
    rt.resolve(host).unwrap();
    assert_eq!(rt.state(translations).unwrap(), BundleState::Resolved);

    // The fragment's export is served by the host
    let client = rt
        .install(
            "loc://client",
            manifest("client", "1.0").import(ImportSpec::new("host.messages", "")),
        )
        .unwrap();
    rt.resolve(client).unwrap();
    assert_eq!(
        rt.wired_provider(client, "host.messages").unwrap(),
        Some(host)
    );
}

#[test]
fn test_blocking_fragment_is_detached_not_fatal() {
    let rt = ModuleRuntime::new();
    let host = rt.install("loc://host", manifest("host", "1.0")).unwrap();
    let broken = rt
        .install(
            "loc://broken",
            manifest("broken", "1.0")
                .fragment_of("host", "")
                .unwrap()
                .import(ImportSpec::new("no.such.pkg", "")),
        )
        .unwrap();

    // The host resolves anyway; the blocking fragment is thrown out
    rt.resolve(host).unwrap();
    assert_eq!(rt.state(host).unwrap(), BundleState::Resolved);
    assert_eq!(rt.state(broken).unwrap(), BundleState::Installed);
}

#[test]
fn test_start_stop_ordering_through_shutdown() {
    let rt = ModuleRuntime::new();
    let recorder = Arc::new(Recorder::default());

    let base = rt
        .install_with_activator(
            "loc://base",
            manifest("base", "1.0")
                .with_activator()
                .export(ExportSpec::new("base.api", "1.0")),
            recorder.clone(),
        )
        .unwrap();
    let app = rt
        .install_with_activator(
            "loc://app",
            manifest("app", "1.0")
                .with_activator()
                .import(ImportSpec::new("base.api", "")),
            recorder.clone(),
        )
        .unwrap();

    rt.start(base, StartOptions::default()).unwrap();
    rt.start(app, StartOptions::default()).unwrap();
    assert_eq!(rt.state(base).unwrap(), BundleState::Active);
    assert_eq!(rt.state(app).unwrap(), BundleState::Active);

    rt.shutdown();
    assert_eq!(
        *recorder.calls.lock(),
        vec![
            "start base:1.0.0",
            "start app:1.0.0",
            "stop app:1.0.0",
            "stop base:1.0.0"
        ]
    );
}

#[test]
fn test_uninstall_and_refresh_clears_the_graph() {
    let rt = ModuleRuntime::new();
    let provider = rt
        .install(
            "loc://provider",
            manifest("provider", "1.0").export(ExportSpec::new("svc", "1.0")),
        )
        .unwrap();
    let consumer = rt
        .install(
            "loc://consumer",
            manifest("consumer", "1.0").import(ImportSpec::new("svc", "")),
        )
        .unwrap();
    rt.resolve(consumer).unwrap();

    rt.uninstall(provider).unwrap();
    assert_eq!(rt.state(provider).unwrap(), BundleState::Uninstalled);
    // The consumer keeps running against the zombie
    assert_eq!(rt.state(consumer).unwrap(), BundleState::Resolved);

    rt.refresh(&[]).unwrap();
    assert_eq!(rt.state(consumer).unwrap(), BundleState::Installed);
    assert!(rt.resolve(consumer).is_err());

    // A replacement provider clears the way again
    rt.install(
        "loc://provider2",
        manifest("provider2", "1.0").export(ExportSpec::new("svc", "1.0")),
    )
    .unwrap();
    rt.resolve(consumer).unwrap();
    assert_eq!(rt.state(consumer).unwrap(), BundleState::Resolved);
}

#[test]
fn test_state_survives_restart_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundles.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        let rt = ModuleRuntime::new().with_storage(Box::new(store));
        rt.install(
            "loc://provider",
            manifest("provider", "1.0").export(ExportSpec::new("svc", "1.0")),
        )
        .unwrap();
        rt.install(
            "loc://consumer",
            manifest("consumer", "1.0").import(ImportSpec::new("svc", "")),
        )
        .unwrap();
        rt.shutdown();
    }

    let store = SqliteStore::open(&path).unwrap();
    let rt = ModuleRuntime::new().with_storage(Box::new(store));
    let installed = rt.load_persisted().unwrap();
    assert_eq!(installed.len(), 2);

    let consumer = rt.find_bundle("consumer").unwrap();
    rt.resolve(consumer).unwrap();
    assert_eq!(rt.state(consumer).unwrap(), BundleState::Resolved);
}
