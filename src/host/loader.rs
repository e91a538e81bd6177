//! Dynamic Module Loader
//!
//! Safe wrapper around libloading for opening modules and resolving their
//! entry points.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use super::error::{HostError, HostResult};
use super::instance::{InstanceOptions, InstanceState, ModuleInstance, ShutdownOutcome};
use crate::abi::{
    AbiVersionFn, EntryPoints, HandleProxyRequestFn, HandleRequestFn, OnLoadFn, OnUnloadFn,
    ABI_VERSION_SYMBOL, HANDLE_PROXY_REQUEST_SYMBOL, HANDLE_REQUEST_SYMBOL, ON_LOAD_SYMBOL,
    ON_UNLOAD_SYMBOL,
};

/// An opened module library and the entry points resolved from it
pub struct DynamicModule {
    /// Path the library was opened from
    path: PathBuf,
    /// The loaded library handle; keeps `entry` callable
    library: Library,
    entry: EntryPoints,
}

impl DynamicModule {
    /// Open a module and resolve its entry points
    pub fn load(path: impl AsRef<Path>) -> HostResult<Self> {
        let path = path.as_ref().to_path_buf();

        // Safety: opening a library runs its static initializers. The host
        // trusts the configured module path.
        let library = unsafe {
            Library::new(&path).map_err(|e| HostError::Load {
                path: path.clone(),
                reason: e.to_string(),
            })?
        };

        // Safety: symbol types match the signatures fixed by the ABI; a module
        // exporting these names with other signatures breaks the contract.
        let entry = unsafe {
            let handle_request = *library
                .get::<HandleRequestFn>(HANDLE_REQUEST_SYMBOL)
                .map_err(|_| HostError::SymbolNotFound {
                    symbol: "HandleRequest".to_string(),
                    path: path.clone(),
                })?;

            EntryPoints {
                handle_request,
                handle_proxy_request: library
                    .get::<HandleProxyRequestFn>(HANDLE_PROXY_REQUEST_SYMBOL)
                    .ok()
                    .map(|s| *s),
                on_load: library.get::<OnLoadFn>(ON_LOAD_SYMBOL).ok().map(|s| *s),
                on_unload: library.get::<OnUnloadFn>(ON_UNLOAD_SYMBOL).ok().map(|s| *s),
                abi_version: library
                    .get::<AbiVersionFn>(ABI_VERSION_SYMBOL)
                    .ok()
                    .map(|s| *s),
            }
        };

        Ok(Self {
            path,
            library,
            entry,
        })
    }

    /// Get the path to this module
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_points(&self) -> &EntryPoints {
        &self.entry
    }

    pub(crate) fn into_parts(self) -> (PathBuf, Library, EntryPoints) {
        (self.path, self.library, self.entry)
    }
}

/// Module loader with search paths and a registry of live instances
pub struct ModuleLoader {
    /// Search paths for modules
    search_paths: Vec<PathBuf>,
    /// Live instances by canonical path
    modules: HashMap<PathBuf, Arc<ModuleInstance>>,
    /// Options applied to every instance this loader opens
    options: InstanceOptions,
}

impl ModuleLoader {
    /// Create a new module loader
    pub fn new() -> Self {
        Self::with_options(InstanceOptions::default())
    }

    pub fn with_options(options: InstanceOptions) -> Self {
        Self {
            search_paths: default_search_paths(),
            modules: HashMap::new(),
            options,
        }
    }

    /// Add a search path
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find a module by name or path
    pub fn find_module(&self, name: &str) -> Option<PathBuf> {
        // If it's already a path, check if it exists
        let path = Path::new(name);
        if path.exists() {
            return Some(path.to_path_buf());
        }

        let lib_name = library_filename(name);
        self.search_paths
            .iter()
            .map(|dir| dir.join(&lib_name))
            .find(|candidate| candidate.exists())
    }

    /// Load a module by name or path.
    ///
    /// A second load of the same library is refused until the first instance
    /// is `Unloaded`: the dynamic loader would hand back the already-mapped
    /// image, and its process-wide state would be shared by two load instances.
    pub fn load(&mut self, name: &str) -> HostResult<Arc<ModuleInstance>> {
        let path = self
            .find_module(name)
            .ok_or_else(|| HostError::ModuleNotFound(name.to_string()))?;
        let key = path.canonicalize().unwrap_or_else(|_| path.clone());

        if let Some(existing) = self.modules.get(&key) {
            ensure_reloadable(existing)?;
        }

        let instance = Arc::new(ModuleInstance::open_with(&path, self.options.clone())?);
        self.modules.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    /// Get a loaded module by name or path
    pub fn get(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.modules
            .values()
            .find(|m| m.name() == name || m.path().is_some_and(|p| p == Path::new(name)))
            .cloned()
    }

    /// Shut down and forget a module.
    ///
    /// Returns `None` if no module by that name is registered.
    pub fn unload(&mut self, name: &str) -> Option<ShutdownOutcome> {
        let key = self
            .modules
            .iter()
            .find(|(_, m)| m.name() == name || m.path().is_some_and(|p| p == Path::new(name)))
            .map(|(k, _)| k.clone())?;
        let instance = self.modules.remove(&key)?;
        Some(instance.shutdown())
    }

    /// Shut down every registered module
    pub fn unload_all(&mut self) {
        for (_, instance) in self.modules.drain() {
            instance.shutdown();
        }
    }

    /// List loaded modules
    pub fn loaded_modules(&self) -> Vec<&str> {
        self.modules.values().map(|m| m.name()).collect()
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModuleLoader {
    fn drop(&mut self) {
        self.unload_all();
    }
}

/// A live or draining instance still owns the image and its statics.
pub(super) fn ensure_reloadable(existing: &ModuleInstance) -> HostResult<()> {
    match existing.state() {
        InstanceState::Unloaded => Ok(()),
        InstanceState::Live | InstanceState::Draining => {
            Err(HostError::AlreadyLoaded(existing.name().to_string()))
        }
    }
}

/// Get the default module search paths for this platform
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Current directory
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));

        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            paths.extend(ld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));

        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            paths.extend(dyld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("PATH") {
            paths.extend(path.split(';').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
    }

    paths
}

/// Construct the platform-specific library filename
pub fn library_filename(name: &str) -> String {
    #[cfg(target_os = "linux")]
    {
        if name.starts_with("lib") && name.ends_with(".so") {
            name.to_string()
        } else {
            format!("lib{}.so", name)
        }
    }

    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") && name.ends_with(".dylib") {
            name.to_string()
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(target_os = "windows")]
    {
        if name.ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        name.to_string()
    }
}
