//! Host side of the module ABI
//!
//! Opens modules, resolves their entry points, and drives their lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use modhost::host::ModuleLoader;
//! use modhost::http::{Request, Response};
//!
//! let mut loader = ModuleLoader::new();
//! let module = loader.load("target/debug/libmodhost_demo.so")?;
//!
//! let req = Request::new("GET", "/");
//! let mut resp = Response::new();
//! module.handle_request(&req, &mut resp)?;
//!
//! loader.unload(module.name());
//! ```

mod bridge;
mod error;
mod instance;
mod loader;

pub use error::{HostError, HostResult};
pub use instance::{
    InstanceOptions, InstanceState, InstanceStats, ModuleInstance, ShutdownOutcome, MIN_DRAIN_WAIT,
};
pub use loader::{library_filename, DynamicModule, ModuleLoader};

#[cfg(test)]
mod tests;
