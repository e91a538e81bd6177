//! Module ABI
//!
//! The `#[repr(C)]` contract shared by the host and every loaded module.
//!
//! # Architecture
//!
//! ```text
//! Host                                   Module (cdylib)
//!  │                                      │
//!  │  RawRequest { magic, ctx, vtable } ──▶ HandleRequest(req, resp)
//!  │  RawResponse{ magic, ctx, vtable } ──▶   │
//!  │                                      │  reads via RequestVTable
//!  │  ◀── callbacks into host memory ─────│  writes via ResponseVTable
//!  │                                      │
//!  │  magic = HANDLE_RETIRED  ◀── return ─┘
//! ```
//!
//! Both handles are opaque to the module: `ctx` points at host-owned data and
//! is only ever passed back to the host's own callbacks. Every pointer handed
//! across is valid for the duration of the entry call that received it and
//! not one instruction longer.

use std::ffi::c_void;
use std::marker::PhantomData;

/// Version of the layout in this module. Bumped on any change to a
/// `#[repr(C)]` type or entry-point signature.
pub const ABI_VERSION: u32 = 1;

/// Stamped on a handle while its call is in progress.
pub const HANDLE_LIVE: u32 = 0x4D4F_444C;
/// Stamped on a handle by the host after its call returned.
pub const HANDLE_RETIRED: u32 = 0xDEAD_0D1E;

/// Mandatory per-request entry point.
pub const HANDLE_REQUEST_SYMBOL: &[u8] = b"HandleRequest\0";
/// Optional proxy routing entry point.
pub const HANDLE_PROXY_REQUEST_SYMBOL: &[u8] = b"HandleProxyRequest\0";
/// Optional eager initialization hook.
pub const ON_LOAD_SYMBOL: &[u8] = b"OnLoad\0";
/// Optional teardown hook, called exactly once per load instance.
pub const ON_UNLOAD_SYMBOL: &[u8] = b"OnUnload\0";
/// Optional ABI version probe.
pub const ABI_VERSION_SYMBOL: &[u8] = b"ModuleAbiVersion\0";

/// `OnLoad` result for a successful initialization.
pub const LOAD_OK: i32 = 0;
/// `OnLoad` result when the module could not initialize.
pub const LOAD_FAILED: i32 = -1;

pub type HandleRequestFn = unsafe extern "C" fn(request: *const RawRequest, response: *mut RawResponse);
pub type HandleProxyRequestFn = unsafe extern "C" fn(
    request: *mut RawRequest,
    response: *mut RawResponse,
    target: *mut RawProxyTarget,
);
pub type OnLoadFn = extern "C" fn() -> i32;
pub type OnUnloadFn = extern "C" fn();
pub type AbiVersionFn = extern "C" fn() -> u32;

/// Entry points resolved from a module.
///
/// Function pointers stay callable only while the code that backs them is
/// mapped; the host never calls one after the owning instance shut down.
#[derive(Clone, Copy)]
pub struct EntryPoints {
    pub handle_request: HandleRequestFn,
    pub handle_proxy_request: Option<HandleProxyRequestFn>,
    pub on_load: Option<OnLoadFn>,
    pub on_unload: Option<OnUnloadFn>,
    pub abi_version: Option<AbiVersionFn>,
}

impl EntryPoints {
    /// Entry points for a module that only exports `HandleRequest`.
    pub fn new(handle_request: HandleRequestFn) -> Self {
        Self {
            handle_request,
            handle_proxy_request: None,
            on_load: None,
            on_unload: None,
            abi_version: None,
        }
    }

    /// Names of the exported symbols, in resolution order.
    pub fn exported(&self) -> Vec<&'static str> {
        let mut names = vec!["HandleRequest"];
        if self.handle_proxy_request.is_some() {
            names.push("HandleProxyRequest");
        }
        if self.on_load.is_some() {
            names.push("OnLoad");
        }
        if self.on_unload.is_some() {
            names.push("OnUnload");
        }
        if self.abi_version.is_some() {
            names.push("ModuleAbiVersion");
        }
        names
    }
}

impl std::fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoints")
            .field("exported", &self.exported())
            .finish()
    }
}

// =============================================================================
// Borrowed byte views
// =============================================================================

/// Borrowed bytes crossing the boundary.
///
/// A null `ptr` means the value is absent, which is distinct from empty.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl FfiStr {
    pub const fn absent() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    pub fn from_text(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    pub fn is_absent(&self) -> bool {
        self.ptr.is_null()
    }

    /// Reborrow the bytes for `'a`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid and unmodified for `'a`.
    pub unsafe fn as_bytes<'a>(self) -> Option<&'a [u8]> {
        if self.ptr.is_null() {
            return None;
        }
        if self.len == 0 {
            return Some(&[]);
        }
        Some(unsafe { std::slice::from_raw_parts(self.ptr, self.len) })
    }
}

// =============================================================================
// Request handle
// =============================================================================

#[repr(C)]
pub struct RequestVTable {
    pub method: unsafe extern "C" fn(ctx: *const c_void) -> FfiStr,
    pub uri: unsafe extern "C" fn(ctx: *const c_void) -> FfiStr,
    pub header: unsafe extern "C" fn(ctx: *const c_void, name: FfiStr) -> FfiStr,
    pub body: unsafe extern "C" fn(ctx: *const c_void) -> FfiStr,
    /// Present only on requests given to `HandleProxyRequest`.
    pub set_uri: Option<unsafe extern "C" fn(ctx: *mut c_void, uri: FfiStr)>,
}

/// Opaque request handle. Owned by the host, borrowed by the module.
#[repr(C)]
pub struct RawRequest {
    pub magic: u32,
    pub ctx: *mut c_void,
    pub vtable: *const RequestVTable,
}

// =============================================================================
// Response handle
// =============================================================================

#[repr(C)]
pub struct ResponseVTable {
    pub status: unsafe extern "C" fn(ctx: *const c_void) -> u16,
    pub set_status: unsafe extern "C" fn(ctx: *mut c_void, status: u16),
    /// Returns `0` on success, `-1` if the host rejected the header.
    pub set_header: unsafe extern "C" fn(ctx: *mut c_void, name: FfiStr, value: FfiStr) -> i32,
    pub write_body: unsafe extern "C" fn(ctx: *mut c_void, bytes: FfiStr),
}

/// Opaque response handle. Owned by the host, written by the module.
#[repr(C)]
pub struct RawResponse {
    pub magic: u32,
    pub ctx: *mut c_void,
    pub vtable: *const ResponseVTable,
}

// =============================================================================
// Proxy target slot
// =============================================================================

/// Host-owned slot a proxy handler writes its upstream address into.
#[repr(C)]
pub struct RawProxyTarget {
    pub magic: u32,
    pub ctx: *mut c_void,
    pub set: unsafe extern "C" fn(ctx: *mut c_void, address: FfiStr),
}

/// Ties a raw handle to the borrow of the host data it points at.
///
/// Built by the host right before an entry call and retired right after.
pub struct CallFrame<'call, T: Retire> {
    raw: T,
    _borrow: PhantomData<&'call mut ()>,
}

impl<'call, T: Retire> CallFrame<'call, T> {
    pub(crate) fn new(raw: T) -> Self {
        Self {
            raw,
            _borrow: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *const T {
        &self.raw
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        &mut self.raw
    }

    pub fn is_live(&self) -> bool {
        self.raw.magic() == HANDLE_LIVE
    }
}

impl<T: Retire> Drop for CallFrame<'_, T> {
    fn drop(&mut self) {
        self.raw.retire();
    }
}

/// Handles that carry a liveness stamp.
pub trait Retire {
    fn magic(&self) -> u32;
    fn retire(&mut self);
}

macro_rules! impl_retire {
    ($($ty:ty),*) => {
        $(
            impl Retire for $ty {
                fn magic(&self) -> u32 {
                    self.magic
                }

                fn retire(&mut self) {
                    self.magic = HANDLE_RETIRED;
                    self.ctx = std::ptr::null_mut();
                }
            }
        )*
    };
}

impl_retire!(RawRequest, RawResponse, RawProxyTarget);
