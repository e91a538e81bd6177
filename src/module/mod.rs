//! Module side of the ABI
//!
//! Everything a module crate needs to implement the entry points safely:
//! borrowed handle views, the process-wide [`ModuleContext`], and the
//! [`export_module!`](crate::export_module) macro that wires a [`Handler`]
//! to the exported symbols.
//!
//! # Example
//!
//! ```ignore
//! use modhost::module::{Handler, Request, Response};
//!
//! pub struct Hello;
//!
//! impl Handler for Hello {
//!     fn init() -> anyhow::Result<Self> {
//!         Ok(Hello)
//!     }
//!
//!     fn handle(&self, req: &Request<'_>, resp: &mut Response<'_>) {
//!         resp.set_status(200);
//!         resp.write_str(req.uri());
//!     }
//! }
//!
//! modhost::export_module!(Hello);
//! ```

mod context;
mod handles;
mod macros;

pub use context::{ModuleContext, Phase};
pub use handles::{HeaderRejected, ProxyRequest, Request, Response};

/// Module-defined request processing.
///
/// One value lives per load generation and is shared by every concurrent
/// call, hence `Send + Sync`. Anything mutable inside it needs its own
/// synchronization.
pub trait Handler: Send + Sync + Sized + 'static {
    /// Build the module state. Runs from `OnLoad`, or on the first request if
    /// the host never called `OnLoad`.
    fn init() -> anyhow::Result<Self>;

    /// Process one request. Must return in bounded time: the host has no way
    /// to pre-empt it.
    fn handle(&self, req: &Request<'_>, resp: &mut Response<'_>);

    /// Pick an upstream for the request, optionally rewriting its URI.
    /// `None` leaves the request unproxied.
    fn proxy(&self, _req: &mut ProxyRequest<'_>, _resp: &mut Response<'_>) -> Option<String> {
        None
    }

    /// Release process-wide resources. Runs once, after the last request of
    /// the generation returned. Errors are logged, never propagated.
    fn shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
