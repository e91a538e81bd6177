//! Module instance lifecycle
//!
//! One `ModuleInstance` is one load instance: `OnLoad` (if exported) runs once
//! right after construction, `HandleRequest` runs any number of times from any
//! number of threads, and `OnUnload` (if exported) runs exactly once, after the
//! last admitted call returned.
//!
//! ```text
//!   Live ──shutdown()──▶ Draining ──in_flight == 0──▶ OnUnload ──▶ Unloaded
//!    │                      │
//!    └─ calls admitted      └─ new calls refused (HostError::ShuttingDown)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use libloading::Library;
use parking_lot::{Condvar, Mutex};

use super::bridge;
use super::error::{HostError, HostResult};
use super::loader::DynamicModule;
use crate::abi::{EntryPoints, ABI_VERSION, LOAD_OK};
use crate::http::{Request, Response};

/// Per-instance knobs, usually taken from [`crate::config::HostSettings`].
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// How often a shutdown stuck behind in-flight calls logs a warning
    pub drain_warn_interval: Duration,
    /// Refuse modules that do not export `ModuleAbiVersion`
    pub require_abi_version: bool,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            drain_warn_interval: Duration::from_secs(1),
            require_abi_version: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Accepting calls
    Live,
    /// Shutdown begun, waiting for in-flight calls
    Draining,
    /// `OnUnload` has run and the library is released
    Unloaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// This call performed the shutdown
    Completed {
        /// Calls still in flight when shutdown began
        calls_drained: usize,
        /// Whether the module exported `OnUnload`
        unload_hook: bool,
    },
    /// Another caller already shut this instance down
    AlreadyShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceStats {
    pub state: InstanceState,
    pub calls_served: u64,
    pub in_flight: usize,
    pub peak_concurrency: usize,
}

struct Gate {
    state: InstanceState,
    in_flight: usize,
}

/// A loaded module
pub struct ModuleInstance {
    name: String,
    path: Option<PathBuf>,
    entry: EntryPoints,
    /// `None` for in-process modules, and after unload
    library: Mutex<Option<Library>>,
    gate: Mutex<Gate>,
    /// Signalled when `in_flight` reaches 0
    drained: Condvar,
    /// Signalled once the state reaches `Unloaded`
    unloaded: Condvar,
    calls_served: AtomicU64,
    peak_concurrency: AtomicUsize,
    options: InstanceOptions,
}

impl ModuleInstance {
    /// Open a module library from `path`
    pub fn open(path: impl AsRef<Path>) -> HostResult<Self> {
        Self::open_with(path, InstanceOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: InstanceOptions) -> HostResult<Self> {
        let (path, library, entry) = DynamicModule::load(path)?.into_parts();
        let name = module_name(&path);
        Self::start(name, Some(path), Some(library), entry, options)
    }

    /// Host a module whose entry points are already in this process
    pub fn from_entry_points(name: impl Into<String>, entry: EntryPoints) -> HostResult<Self> {
        Self::from_entry_points_with(name, entry, InstanceOptions::default())
    }

    pub fn from_entry_points_with(
        name: impl Into<String>,
        entry: EntryPoints,
        options: InstanceOptions,
    ) -> HostResult<Self> {
        Self::start(name.into(), None, None, entry, options)
    }

    fn start(
        name: String,
        path: Option<PathBuf>,
        library: Option<Library>,
        entry: EntryPoints,
        options: InstanceOptions,
    ) -> HostResult<Self> {
        match entry.abi_version.map(|probe| probe()) {
            Some(found) if found != ABI_VERSION => {
                return Err(HostError::IncompatibleAbi {
                    module: name,
                    expected: ABI_VERSION,
                    found,
                });
            }
            None if options.require_abi_version => {
                return Err(HostError::IncompatibleAbi {
                    module: name,
                    expected: ABI_VERSION,
                    found: 0,
                });
            }
            _ => {}
        }

        let instance = Self {
            name,
            path,
            entry,
            library: Mutex::new(library),
            gate: Mutex::new(Gate {
                state: InstanceState::Live,
                in_flight: 0,
            }),
            drained: Condvar::new(),
            unloaded: Condvar::new(),
            calls_served: AtomicU64::new(0),
            peak_concurrency: AtomicUsize::new(0),
            options,
        };

        if let Some(on_load) = instance.entry.on_load {
            let code = on_load();
            if code != LOAD_OK {
                tracing::error!(module = %instance.name, code, "module failed to initialize");
                instance.shutdown();
                return Err(HostError::InitFailed {
                    module: instance.name.clone(),
                    code,
                });
            }
        }

        tracing::info!(
            module = %instance.name,
            exports = ?instance.entry.exported(),
            "module loaded"
        );
        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Library path, `None` for in-process modules
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entry_points(&self) -> &EntryPoints {
        &self.entry
    }

    pub fn state(&self) -> InstanceState {
        self.gate.lock().state
    }

    pub fn is_live(&self) -> bool {
        self.state() == InstanceState::Live
    }

    pub fn stats(&self) -> InstanceStats {
        let gate = self.gate.lock();
        InstanceStats {
            state: gate.state,
            calls_served: self.calls_served.load(Ordering::Relaxed),
            in_flight: gate.in_flight,
            peak_concurrency: self.peak_concurrency.load(Ordering::Relaxed),
        }
    }

    fn admit(&self) -> HostResult<CallGuard<'_>> {
        let mut gate = self.gate.lock();
        if gate.state != InstanceState::Live {
            tracing::warn!(module = %self.name, state = ?gate.state, "call refused");
            return Err(HostError::ShuttingDown(self.name.clone()));
        }
        gate.in_flight += 1;
        self.peak_concurrency
            .fetch_max(gate.in_flight, Ordering::Relaxed);
        Ok(CallGuard { instance: self })
    }

    /// Run `HandleRequest` for one request.
    ///
    /// Blocks until the module returns. Both handles are retired before the
    /// call is counted as finished.
    pub fn handle_request(&self, req: &Request, resp: &mut Response) -> HostResult<()> {
        let _guard = self.admit()?;
        let request = bridge::request_frame(req);
        let mut response = bridge::response_frame(resp);

        // Safety: both frames point at data borrowed for this scope, and the
        // admission guard keeps the library mapped until after they retire.
        unsafe { (self.entry.handle_request)(request.as_ptr(), response.as_mut_ptr()) };
        Ok(())
    }

    /// Run `HandleProxyRequest`, returning the upstream address the module
    /// chose, if any. The module may rewrite `req.uri`.
    pub fn handle_proxy_request(
        &self,
        req: &mut Request,
        resp: &mut Response,
    ) -> HostResult<Option<String>> {
        let proxy = self
            .entry
            .handle_proxy_request
            .ok_or_else(|| HostError::EntryPointMissing {
                module: self.name.clone(),
                entry_point: "HandleProxyRequest",
            })?;
        let _guard = self.admit()?;

        let mut target = None;
        {
            let mut request = bridge::rewritable_request_frame(req);
            let mut response = bridge::response_frame(resp);
            let mut slot = bridge::proxy_target_frame(&mut target);

            // Safety: as in `handle_request`.
            unsafe { proxy(request.as_mut_ptr(), response.as_mut_ptr(), slot.as_mut_ptr()) };
        }
        Ok(target)
    }

    /// Stop admitting calls, wait for in-flight calls, run `OnUnload`, and
    /// release the library.
    ///
    /// A caller that finds another shutdown in progress blocks until the
    /// instance is `Unloaded`, then gets `AlreadyShutDown`.
    ///
    /// Must not be called from inside a call into this module: it would wait
    /// on itself.
    pub fn shutdown(&self) -> ShutdownOutcome {
        let warn_interval = drain_wait(self.options.drain_warn_interval);
        let calls_drained = {
            let mut gate = self.gate.lock();
            if gate.state != InstanceState::Live {
                while gate.state != InstanceState::Unloaded {
                    self.unloaded.wait(&mut gate);
                }
                return ShutdownOutcome::AlreadyShutDown;
            }
            gate.state = InstanceState::Draining;
            let pending = gate.in_flight;

            while gate.in_flight > 0 {
                let waited = self.drained.wait_for(&mut gate, warn_interval);
                if waited.timed_out() && gate.in_flight > 0 {
                    tracing::warn!(
                        module = %self.name,
                        in_flight = gate.in_flight,
                        "waiting for in-flight calls before unload"
                    );
                }
            }
            pending
        };

        let unload_hook = match self.entry.on_unload {
            Some(on_unload) => {
                on_unload();
                true
            }
            None => false,
        };

        // Unmap before publishing `Unloaded`; a reload may follow at once.
        drop(self.library.lock().take());
        self.gate.lock().state = InstanceState::Unloaded;
        self.unloaded.notify_all();

        tracing::info!(
            module = %self.name,
            calls_served = self.calls_served.load(Ordering::Relaxed),
            calls_drained,
            "module unloaded"
        );
        ShutdownOutcome::Completed {
            calls_drained,
            unload_hook,
        }
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("entry", &self.entry)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Counts one admitted call for the drain in `shutdown`.
struct CallGuard<'a> {
    instance: &'a ModuleInstance,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut gate = self.instance.gate.lock();
        gate.in_flight -= 1;
        self.instance.calls_served.fetch_add(1, Ordering::Relaxed);
        if gate.in_flight == 0 {
            self.instance.drained.notify_all();
        }
    }
}

/// Shortest wait between drain warnings
pub const MIN_DRAIN_WAIT: Duration = Duration::from_millis(1);

/// A zero interval would turn the drain wait into a spin.
fn drain_wait(interval: Duration) -> Duration {
    interval.max(MIN_DRAIN_WAIT)
}

/// `libdemo.so` → `demo`
fn module_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module");
    stem.strip_prefix("lib").unwrap_or(stem).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name() {
        assert_eq!(module_name(Path::new("/opt/mods/libdemo.so")), "demo");
        assert_eq!(module_name(Path::new("handler.dll")), "handler");
        assert_eq!(module_name(Path::new("liblib.dylib")), "lib");
    }

    #[test]
    fn test_drain_wait_has_floor() {
        assert_eq!(drain_wait(Duration::ZERO), MIN_DRAIN_WAIT);
        assert_eq!(drain_wait(Duration::from_micros(10)), MIN_DRAIN_WAIT);
        assert_eq!(drain_wait(Duration::from_secs(2)), Duration::from_secs(2));
    }
}
