//! Process-wide module state
//!
//! `ModuleContext` is the only state a module shares across calls. It answers
//! "what is shared" by inspection: one handler value behind a read-write lock.
//!
//! - Requests hold the read lock for the duration of the handler call, so any
//!   number of them run concurrently.
//! - `OnUnload` takes the write lock, so teardown starts only once every
//!   in-flight request has returned, whatever the host does.
//! - Each successful `OnLoad` (or lazy first-request init) starts a new load
//!   generation; `OnUnload` ends it exactly once.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::handles::{set_proxy_target, ProxyRequest, Request, Response};
use super::Handler;
use crate::abi::{RawProxyTarget, RawRequest, RawResponse, LOAD_FAILED, LOAD_OK};

enum Slot<H> {
    /// Never initialized, or initialization failed
    Fresh,
    Live(H),
    /// `OnUnload` ran; only a new `OnLoad` revives the context
    TornDown,
}

/// Lifecycle phase, as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    Live,
    TornDown,
}

pub struct ModuleContext<H> {
    slot: RwLock<Slot<H>>,
    generation: AtomicU64,
    calls: AtomicU64,
}

impl<H: Handler> ModuleContext<H> {
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_rwlock(Slot::Fresh),
            generation: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> Phase {
        match &*self.slot.read() {
            Slot::Fresh => Phase::Fresh,
            Slot::Live(_) => Phase::Live,
            Slot::TornDown => Phase::TornDown,
        }
    }

    /// Number of load generations started so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Requests dispatched to a handler, across all generations
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn initialize(&self) -> Option<H> {
        crate::logging::init_module_logging();
        match panic::catch_unwind(H::init) {
            Ok(Ok(handler)) => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::debug!(generation, "module context initialized");
                Some(handler)
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "module initialization failed");
                None
            }
            Err(payload) => {
                tracing::error!(panic = panic_message(&*payload), "module initialization panicked");
                None
            }
        }
    }

    /// `OnLoad`: initialize eagerly.
    pub fn load(&self) -> i32 {
        let mut slot = self.slot.write();
        if let Slot::Live(_) = &*slot {
            tracing::warn!("OnLoad called on a live module; keeping current state");
            return LOAD_OK;
        }
        match self.initialize() {
            Some(handler) => {
                *slot = Slot::Live(handler);
                LOAD_OK
            }
            None => {
                *slot = Slot::Fresh;
                LOAD_FAILED
            }
        }
    }

    /// Run `f` against the live handler, initializing lazily if the host never
    /// called `OnLoad`. `None` after teardown or when initialization fails.
    fn with_handler<R>(&self, f: impl FnOnce(&H) -> R) -> Option<R> {
        {
            let slot = self.slot.read();
            match &*slot {
                Slot::Live(handler) => return Some(f(handler)),
                Slot::TornDown => {
                    tracing::error!("request after OnUnload; handles left untouched");
                    return None;
                }
                Slot::Fresh => {}
            }
        }

        {
            let mut slot = self.slot.write();
            if let Slot::Fresh = &*slot {
                *slot = Slot::Live(self.initialize()?);
            }
        }

        match &*self.slot.read() {
            Slot::Live(handler) => Some(f(handler)),
            _ => None,
        }
    }

    /// `HandleRequest`
    ///
    /// # Safety
    ///
    /// Both pointers must be null or handles the host made live for this call.
    pub unsafe fn handle_request(&self, request: *const RawRequest, response: *mut RawResponse) {
        let (Some(req), Some(mut resp)) =
            (unsafe { Request::from_raw(request) }, unsafe { Response::from_raw(response) })
        else {
            tracing::error!("HandleRequest called with a null handle");
            return;
        };

        self.with_handler(|handler| {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&req, &mut resp)));
            if let Err(payload) = outcome {
                tracing::error!(
                    panic = panic_message(&*payload),
                    method = req.method(),
                    uri = req.uri(),
                    "handler panicked"
                );
                if resp.status() == 0 {
                    resp.set_status(500);
                }
            }
        });
    }

    /// `HandleProxyRequest`
    ///
    /// # Safety
    ///
    /// As for [`Self::handle_request`].
    pub unsafe fn handle_proxy_request(
        &self,
        request: *mut RawRequest,
        response: *mut RawResponse,
        target: *mut RawProxyTarget,
    ) {
        let (Some(mut req), Some(mut resp)) =
            (unsafe { ProxyRequest::from_raw(request) }, unsafe { Response::from_raw(response) })
        else {
            tracing::error!("HandleProxyRequest called with a null or read-only handle");
            return;
        };

        self.with_handler(|handler| {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| handler.proxy(&mut req, &mut resp)));
            match outcome {
                Ok(Some(address)) => {
                    if !unsafe { set_proxy_target(target, &address) } {
                        tracing::error!("proxy target handle is null");
                    }
                }
                Ok(None) => {}
                Err(payload) => {
                    tracing::error!(panic = panic_message(&*payload), "proxy handler panicked");
                    if resp.status() == 0 {
                        resp.set_status(500);
                    }
                }
            }
        });
    }

    /// `OnUnload`: tear down exactly once per generation.
    ///
    /// Never propagates: failures and panics in the handler's shutdown are
    /// logged here because nothing on the other side can react to them.
    pub fn unload(&self) {
        let mut slot = self.slot.write();
        match std::mem::replace(&mut *slot, Slot::TornDown) {
            Slot::Live(mut handler) => {
                let generation = self.generation();
                match panic::catch_unwind(AssertUnwindSafe(|| handler.shutdown())) {
                    Ok(Ok(())) => tracing::debug!(generation, "module context torn down"),
                    Ok(Err(e)) => tracing::warn!(generation, error = %e, "module shutdown failed"),
                    Err(payload) => tracing::error!(
                        generation,
                        panic = panic_message(&*payload),
                        "module shutdown panicked"
                    ),
                }
                if panic::catch_unwind(AssertUnwindSafe(|| drop(handler))).is_err() {
                    tracing::error!(generation, "module state panicked while dropping");
                }
            }
            Slot::Fresh => tracing::debug!("OnUnload before any initialization"),
            Slot::TornDown => tracing::warn!("OnUnload called twice; ignoring"),
        }
    }
}

impl<H: Handler> Default for ModuleContext<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
