//! Host Module Tests

use super::*;
use crate::abi::{EntryPoints, RawRequest, RawResponse, ABI_VERSION, LOAD_FAILED};
use crate::http::{Request, Response};
use crate::module::{self, Handler, ProxyRequest};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

// =============================================================================
// Handlers hosted in-process
// =============================================================================

struct Echo;

impl Handler for Echo {
    fn init() -> anyhow::Result<Self> {
        Ok(Echo)
    }

    fn handle(&self, req: &module::Request<'_>, resp: &mut module::Response<'_>) {
        resp.set_status(201);
        resp.set_header("X-Method", req.method()).unwrap();
        resp.set_header("x-agent", req.header("user-agent").unwrap_or("-"))
            .unwrap();
        match req.body() {
            Some(body) => resp.write_body(body),
            None => resp.write_str(req.uri()),
        }
    }

    fn proxy(&self, req: &mut ProxyRequest<'_>, _resp: &mut module::Response<'_>) -> Option<String> {
        let mut parts = req.uri().splitn(3, '/').skip(1);
        let address = parts.next().filter(|a| !a.is_empty())?.to_string();
        let rest = format!("/{}", parts.next().unwrap_or(""));
        req.set_uri(&rest);
        Some(address)
    }
}

// One context per test: tearing one instance down must not affect another.
crate::declare_module!(mod echo => Echo);
crate::declare_module!(mod echo_proxy => Echo);
crate::declare_module!(mod echo_versioned => Echo);

struct Strict;

impl Handler for Strict {
    fn init() -> anyhow::Result<Self> {
        Ok(Strict)
    }

    fn handle(&self, _req: &module::Request<'_>, resp: &mut module::Response<'_>) {
        match resp.set_header("bad name", "x") {
            Ok(()) => resp.set_status(200),
            Err(_) => resp.set_status(400),
        }
    }
}

crate::declare_module!(mod strict => Strict);

// =============================================================================
// Raw entry points with observable hooks
// =============================================================================

unsafe extern "C" fn ignore_request(_: *const RawRequest, _: *mut RawResponse) {}

#[test]
fn test_round_trip_through_handles() {
    let instance = ModuleInstance::from_entry_points("echo", echo::entry_points()).unwrap();

    let req = Request::new("POST", "/submit").with_header("User-Agent", "curl/8");
    let mut resp = Response::new();
    instance.handle_request(&req, &mut resp).unwrap();

    assert_eq!(resp.status, 201);
    assert_eq!(resp.header("x-method"), Some("POST"));
    assert_eq!(resp.header("X-Agent"), Some("curl/8"));
    assert_eq!(resp.body, b"/submit");

    let req = Request::new("PUT", "/").with_body("payload");
    let mut resp = Response::new();
    instance.handle_request(&req, &mut resp).unwrap();
    assert_eq!(resp.body, b"payload");
    assert_eq!(resp.header("x-agent"), Some("-"));

    assert_eq!(instance.stats().calls_served, 2);
}

#[test]
fn test_rejected_header_reported_to_module() {
    let instance = ModuleInstance::from_entry_points("strict", strict::entry_points()).unwrap();
    let mut resp = Response::new();
    instance
        .handle_request(&Request::new("GET", "/"), &mut resp)
        .unwrap();
    assert_eq!(resp.status, 400);
    assert_eq!(resp.headers().count(), 0);
}

#[test]
fn test_proxy_routing_rewrites_uri() {
    let instance =
        ModuleInstance::from_entry_points("echo_proxy", echo_proxy::entry_points()).unwrap();

    let mut req = Request::new("GET", "/backend:8080/api/items");
    let mut resp = Response::new();
    let target = instance.handle_proxy_request(&mut req, &mut resp).unwrap();
    assert_eq!(target.as_deref(), Some("backend:8080"));
    assert_eq!(req.uri, "/api/items");

    let mut req = Request::new("GET", "/");
    let target = instance.handle_proxy_request(&mut req, &mut resp).unwrap();
    assert_eq!(target, None);
    assert_eq!(req.uri, "/");
}

#[test]
fn test_proxy_entry_point_missing() {
    let instance =
        ModuleInstance::from_entry_points("plain", EntryPoints::new(ignore_request)).unwrap();
    let mut req = Request::new("GET", "/a/b");
    let err = instance
        .handle_proxy_request(&mut req, &mut Response::new())
        .unwrap_err();
    assert!(matches!(
        err,
        HostError::EntryPointMissing {
            entry_point: "HandleProxyRequest",
            ..
        }
    ));
}

#[test]
fn test_unload_hook_runs_once() {
    static UNLOADS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn on_unload() {
        UNLOADS.fetch_add(1, Ordering::SeqCst);
    }

    let mut entry = EntryPoints::new(ignore_request);
    entry.on_unload = Some(on_unload);
    let instance = ModuleInstance::from_entry_points("hooked", entry).unwrap();

    assert_eq!(
        instance.shutdown(),
        ShutdownOutcome::Completed {
            calls_drained: 0,
            unload_hook: true
        }
    );
    assert_eq!(instance.shutdown(), ShutdownOutcome::AlreadyShutDown);
    drop(instance);
    assert_eq!(UNLOADS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_shuts_down() {
    static UNLOADS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn on_unload() {
        UNLOADS.fetch_add(1, Ordering::SeqCst);
    }

    let mut entry = EntryPoints::new(ignore_request);
    entry.on_unload = Some(on_unload);
    drop(ModuleInstance::from_entry_points("dropped", entry).unwrap());
    assert_eq!(UNLOADS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_calls_refused_after_shutdown() {
    let instance =
        ModuleInstance::from_entry_points("closed", EntryPoints::new(ignore_request)).unwrap();
    instance.shutdown();
    assert_eq!(instance.state(), InstanceState::Unloaded);

    let mut resp = Response::new();
    let err = instance
        .handle_request(&Request::new("GET", "/"), &mut resp)
        .unwrap_err();
    assert!(matches!(err, HostError::ShuttingDown(name) if name == "closed"));
    assert!(resp.is_untouched());
}

#[test]
fn test_concurrent_shutdown_waits_for_unload() {
    static HOLD: AtomicBool = AtomicBool::new(true);
    static ENTERED: AtomicBool = AtomicBool::new(false);
    static UNLOADS: AtomicUsize = AtomicUsize::new(0);
    unsafe extern "C" fn held_request(_: *const RawRequest, _: *mut RawResponse) {
        ENTERED.store(true, Ordering::SeqCst);
        while HOLD.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    extern "C" fn slow_unload() {
        std::thread::sleep(Duration::from_millis(50));
        UNLOADS.fetch_add(1, Ordering::SeqCst);
    }

    let mut entry = EntryPoints::new(held_request);
    entry.on_unload = Some(slow_unload);
    let options = InstanceOptions {
        drain_warn_interval: Duration::ZERO,
        ..InstanceOptions::default()
    };
    let instance = ModuleInstance::from_entry_points_with("held", entry, options).unwrap();
    let instance = &instance;

    crossbeam::scope(|s| {
        s.spawn(move |_| {
            instance
                .handle_request(&Request::new("GET", "/"), &mut Response::new())
                .unwrap()
        });
        wait_until("call entered", || ENTERED.load(Ordering::SeqCst));

        let first = s.spawn(move |_| instance.shutdown());
        wait_until("draining", || instance.state() == InstanceState::Draining);

        // The image is still in use: a reload of the same path is refused
        let err = loader::ensure_reloadable(instance).unwrap_err();
        assert!(matches!(err, HostError::AlreadyLoaded(name) if name == "held"));

        let second = s.spawn(move |_| {
            let outcome = instance.shutdown();
            (outcome, UNLOADS.load(Ordering::SeqCst), instance.state())
        });
        HOLD.store(false, Ordering::SeqCst);

        assert_eq!(
            first.join().unwrap(),
            ShutdownOutcome::Completed {
                calls_drained: 1,
                unload_hook: true
            }
        );
        let (outcome, unloads, state) = second.join().unwrap();
        assert_eq!(outcome, ShutdownOutcome::AlreadyShutDown);
        assert_eq!(unloads, 1);
        assert_eq!(state, InstanceState::Unloaded);
    })
    .unwrap();

    assert!(loader::ensure_reloadable(instance).is_ok());
    assert_eq!(UNLOADS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_drain_interval_still_drains() {
    static HOLD: AtomicBool = AtomicBool::new(true);
    static ENTERED: AtomicBool = AtomicBool::new(false);
    unsafe extern "C" fn held_request(_: *const RawRequest, _: *mut RawResponse) {
        ENTERED.store(true, Ordering::SeqCst);
        while HOLD.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let options = InstanceOptions {
        drain_warn_interval: Duration::ZERO,
        ..InstanceOptions::default()
    };
    let instance =
        ModuleInstance::from_entry_points_with("zero", EntryPoints::new(held_request), options)
            .unwrap();
    let instance = &instance;

    crossbeam::scope(|s| {
        s.spawn(move |_| {
            instance
                .handle_request(&Request::new("GET", "/"), &mut Response::new())
                .unwrap()
        });
        wait_until("call entered", || ENTERED.load(Ordering::SeqCst));
        let shutdown = s.spawn(move |_| instance.shutdown());
        wait_until("draining", || instance.state() == InstanceState::Draining);

        std::thread::sleep(Duration::from_millis(20));
        HOLD.store(false, Ordering::SeqCst);
        assert_eq!(
            shutdown.join().unwrap(),
            ShutdownOutcome::Completed {
                calls_drained: 1,
                unload_hook: false
            }
        );
    })
    .unwrap();
    assert_eq!(instance.stats().calls_served, 1);
}

#[test]
fn test_failed_load_still_unloads() {
    static UNLOADS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn on_load() -> i32 {
        LOAD_FAILED
    }
    extern "C" fn on_unload() {
        UNLOADS.fetch_add(1, Ordering::SeqCst);
    }

    let mut entry = EntryPoints::new(ignore_request);
    entry.on_load = Some(on_load);
    entry.on_unload = Some(on_unload);

    let err = ModuleInstance::from_entry_points("broken", entry).unwrap_err();
    assert!(matches!(err, HostError::InitFailed { code: LOAD_FAILED, .. }));
    assert_eq!(UNLOADS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_incompatible_abi_runs_no_hooks() {
    static HOOKS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn future_abi() -> u32 {
        ABI_VERSION + 1
    }
    extern "C" fn on_load() -> i32 {
        HOOKS.fetch_add(1, Ordering::SeqCst);
        0
    }
    extern "C" fn on_unload() {
        HOOKS.fetch_add(1, Ordering::SeqCst);
    }

    let mut entry = EntryPoints::new(ignore_request);
    entry.abi_version = Some(future_abi);
    entry.on_load = Some(on_load);
    entry.on_unload = Some(on_unload);

    let err = ModuleInstance::from_entry_points("future", entry).unwrap_err();
    assert!(matches!(
        err,
        HostError::IncompatibleAbi { expected: ABI_VERSION, found, .. } if found == ABI_VERSION + 1
    ));
    assert_eq!(HOOKS.load(Ordering::SeqCst), 0);
}

#[test]
fn test_require_abi_version() {
    let options = InstanceOptions {
        require_abi_version: true,
        ..InstanceOptions::default()
    };
    let err = ModuleInstance::from_entry_points_with(
        "unversioned",
        EntryPoints::new(ignore_request),
        options.clone(),
    )
    .unwrap_err();
    assert!(matches!(err, HostError::IncompatibleAbi { found: 0, .. }));

    let instance = ModuleInstance::from_entry_points_with(
        "versioned",
        echo_versioned::entry_points(),
        options,
    )
    .unwrap();
    assert!(instance.is_live());
}

#[test]
fn test_loader_missing_module() {
    let mut loader = ModuleLoader::new();
    assert!(loader.find_module("definitely_not_a_module").is_none());
    let err = loader.load("definitely_not_a_module").unwrap_err();
    assert!(matches!(err, HostError::ModuleNotFound(_)));
    assert!(loader.loaded_modules().is_empty());
    assert!(loader.unload("definitely_not_a_module").is_none());
}

#[test]
fn test_loader_search_paths() {
    let mut loader = ModuleLoader::new();
    let before = loader.search_paths().len();
    loader.add_search_path("/opt/modules");
    assert_eq!(loader.search_paths().len(), before + 1);
}

#[test]
fn test_library_filename() {
    #[cfg(target_os = "linux")]
    {
        assert_eq!(library_filename("demo"), "libdemo.so");
        assert_eq!(library_filename("libdemo.so"), "libdemo.so");
    }
    #[cfg(target_os = "macos")]
    assert_eq!(library_filename("demo"), "libdemo.dylib");
    #[cfg(target_os = "windows")]
    assert_eq!(library_filename("demo"), "demo.dll");
}
