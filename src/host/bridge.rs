//! Host callbacks behind the request/response vtables.
//!
//! Each callback turns an opaque `ctx` back into the host type it was built
//! from. None of them may unwind: a panic here would cross into module code.

use std::ffi::c_void;

use crate::abi::{
    CallFrame, FfiStr, RawProxyTarget, RawRequest, RawResponse, RequestVTable, ResponseVTable,
    HANDLE_LIVE,
};
use crate::http::{Request, Response};

unsafe fn object<'a, T>(ctx: *const c_void) -> &'a T {
    debug_assert!(!ctx.is_null(), "callback invoked on a retired handle");
    unsafe { &*(ctx as *const T) }
}

unsafe fn object_mut<'a, T>(ctx: *mut c_void) -> &'a mut T {
    debug_assert!(!ctx.is_null(), "callback invoked on a retired handle");
    unsafe { &mut *(ctx as *mut T) }
}

/// Decode module-supplied text. Invalid UTF-8 is replaced, never trusted.
unsafe fn text(value: FfiStr) -> Option<String> {
    unsafe { value.as_bytes() }.map(|b| String::from_utf8_lossy(b).into_owned())
}

// =============================================================================
// Request callbacks
// =============================================================================

unsafe extern "C" fn request_method(ctx: *const c_void) -> FfiStr {
    let req: &Request = unsafe { object(ctx) };
    FfiStr::from_text(&req.method)
}

unsafe extern "C" fn request_uri(ctx: *const c_void) -> FfiStr {
    let req: &Request = unsafe { object(ctx) };
    FfiStr::from_text(&req.uri)
}

unsafe extern "C" fn request_header(ctx: *const c_void, name: FfiStr) -> FfiStr {
    let req: &Request = unsafe { object(ctx) };
    let Some(name) = (unsafe { text(name) }) else {
        return FfiStr::absent();
    };
    req.header(&name).map_or(FfiStr::absent(), FfiStr::from_text)
}

unsafe extern "C" fn request_body(ctx: *const c_void) -> FfiStr {
    let req: &Request = unsafe { object(ctx) };
    req.body
        .as_deref()
        .map_or(FfiStr::absent(), FfiStr::from_bytes)
}

unsafe extern "C" fn request_set_uri(ctx: *mut c_void, uri: FfiStr) {
    let req: &mut Request = unsafe { object_mut(ctx) };
    if let Some(uri) = unsafe { text(uri) } {
        req.uri = uri;
    }
}

static READ_ONLY_REQUEST: RequestVTable = RequestVTable {
    method: request_method,
    uri: request_uri,
    header: request_header,
    body: request_body,
    set_uri: None,
};

static REWRITABLE_REQUEST: RequestVTable = RequestVTable {
    method: request_method,
    uri: request_uri,
    header: request_header,
    body: request_body,
    set_uri: Some(request_set_uri),
};

// =============================================================================
// Response callbacks
// =============================================================================

unsafe extern "C" fn response_status(ctx: *const c_void) -> u16 {
    let resp: &Response = unsafe { object(ctx) };
    resp.status
}

unsafe extern "C" fn response_set_status(ctx: *mut c_void, status: u16) {
    let resp: &mut Response = unsafe { object_mut(ctx) };
    resp.status = status;
}

unsafe extern "C" fn response_set_header(ctx: *mut c_void, name: FfiStr, value: FfiStr) -> i32 {
    let resp: &mut Response = unsafe { object_mut(ctx) };
    let (Some(name), Some(value)) = (unsafe { text(name) }, unsafe { text(value) }) else {
        return -1;
    };
    match resp.set_header(&name, &value) {
        Ok(_) => 0,
        Err(e) => {
            tracing::debug!(error = %e, "module header rejected");
            -1
        }
    }
}

unsafe extern "C" fn response_write_body(ctx: *mut c_void, bytes: FfiStr) {
    let resp: &mut Response = unsafe { object_mut(ctx) };
    if let Some(bytes) = unsafe { bytes.as_bytes() } {
        resp.write_body(bytes);
    }
}

static RESPONSE: ResponseVTable = ResponseVTable {
    status: response_status,
    set_status: response_set_status,
    set_header: response_set_header,
    write_body: response_write_body,
};

// =============================================================================
// Proxy target callback
// =============================================================================

unsafe extern "C" fn proxy_target_set(ctx: *mut c_void, address: FfiStr) {
    let slot: &mut Option<String> = unsafe { object_mut(ctx) };
    *slot = unsafe { text(address) };
}

// =============================================================================
// Frame construction
// =============================================================================

/// Read-only request handle for one `HandleRequest` call.
pub(crate) fn request_frame(req: &Request) -> CallFrame<'_, RawRequest> {
    CallFrame::new(RawRequest {
        magic: HANDLE_LIVE,
        ctx: req as *const Request as *mut c_void,
        vtable: &READ_ONLY_REQUEST,
    })
}

/// Request handle whose URI the module may rewrite.
pub(crate) fn rewritable_request_frame(req: &mut Request) -> CallFrame<'_, RawRequest> {
    CallFrame::new(RawRequest {
        magic: HANDLE_LIVE,
        ctx: req as *mut Request as *mut c_void,
        vtable: &REWRITABLE_REQUEST,
    })
}

pub(crate) fn response_frame(resp: &mut Response) -> CallFrame<'_, RawResponse> {
    CallFrame::new(RawResponse {
        magic: HANDLE_LIVE,
        ctx: resp as *mut Response as *mut c_void,
        vtable: &RESPONSE,
    })
}

pub(crate) fn proxy_target_frame(slot: &mut Option<String>) -> CallFrame<'_, RawProxyTarget> {
    CallFrame::new(RawProxyTarget {
        magic: HANDLE_LIVE,
        ctx: slot as *mut Option<String> as *mut c_void,
        set: proxy_target_set,
    })
}
