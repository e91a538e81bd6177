//! modhost - Native Request-Handler Modules
//!
//! Host and module halves of a small C ABI for request-processing extension
//! modules. A host server loads a compiled module at runtime, hands it opaque
//! request/response handles for the duration of one call, and tears it down
//! exactly once after every in-flight call has returned.
//!
//! # Features
//!
//! - **Stable ABI**: `#[repr(C)]` handles and vtables, versioned entry points
//! - **Borrowed handles**: module-side views cannot outlive the call that produced them
//! - **Exactly-once teardown**: `OnUnload` runs after in-flight calls drain, never twice
//! - **Contained failures**: module panics become a 500 response, never an unwind across the boundary
//!
//! # Example
//!
//! ```ignore
//! use modhost::host::ModuleInstance;
//! use modhost::http::{Request, Response};
//!
//! let module = ModuleInstance::open("target/debug/libmodhost_demo.so")?;
//!
//! let req = Request::new("GET", "/").with_header("User-Agent", "curl/8");
//! let mut resp = Response::new();
//! module.handle_request(&req, &mut resp)?;
//! resp.finalize(modhost::http::DEFAULT_STATUS);
//!
//! module.shutdown();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Host server   │  http::Request / http::Response
//! └────────┬────────┘
//!          │ host::ModuleInstance (admission gate, drain, OnUnload)
//!          ▼
//! ┌─────────────────┐
//! │    abi (C)      │  RawRequest / RawResponse + vtables
//! └────────┬────────┘
//!          │ HandleRequest / OnLoad / OnUnload
//!          ▼
//! ┌─────────────────┐
//! │ module::Handler │  ModuleContext, borrowed Request<'call> / Response<'call>
//! └─────────────────┘
//! ```

#![warn(clippy::all)]

pub mod abi;
pub mod config;
pub mod host;
pub mod http;
pub mod logging;
pub mod module;

pub use abi::{EntryPoints, ABI_VERSION};
pub use config::{ConfigError, HostConfig, LogFormat, LoggingConfig};
pub use host::{
    HostError, HostResult, InstanceOptions, InstanceState, InstanceStats, ModuleInstance,
    ModuleLoader, ShutdownOutcome,
};
pub use module::{Handler, ModuleContext};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
