//! Borrowed views over the host's handles
//!
//! Every view is parameterized by `'call`, the duration of the entry call that
//! produced it. Handlers receive them as `&Request<'_>` / `&mut Response<'_>`,
//! so nothing derived from a handle can be moved into state that outlives the
//! call.

use std::borrow::Cow;
use std::ffi::c_void;
use std::marker::PhantomData;

use thiserror::Error;

use crate::abi::{
    FfiStr, RawProxyTarget, RawRequest, RawResponse, RequestVTable, ResponseVTable, HANDLE_LIVE,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Host rejected header '{0}'")]
pub struct HeaderRejected(pub String);

fn utf8<'a>(bytes: Option<&'a [u8]>) -> Option<&'a str> {
    bytes.and_then(|b| std::str::from_utf8(b).ok())
}

/// Read-only view of the current request
pub struct Request<'call> {
    ctx: *const c_void,
    vtable: &'call RequestVTable,
    _call: PhantomData<&'call RawRequest>,
}

impl<'call> Request<'call> {
    /// Wrap a raw handle.
    ///
    /// Returns `None` for a null handle or vtable; that is the only check made.
    ///
    /// # Safety
    ///
    /// `raw` must come from the host for the current call and stay valid for
    /// `'call`.
    pub unsafe fn from_raw(raw: *const RawRequest) -> Option<Self> {
        let raw = unsafe { raw.as_ref() }?;
        debug_assert_eq!(raw.magic, HANDLE_LIVE, "request handle is not live");
        let vtable = unsafe { raw.vtable.as_ref() }?;
        Some(Self {
            ctx: raw.ctx,
            vtable,
            _call: PhantomData,
        })
    }

    fn bytes(&self, value: FfiStr) -> Option<&'call [u8]> {
        // Safety: the host keeps request data unchanged for the whole call.
        unsafe { value.as_bytes() }
    }

    pub fn method(&self) -> &'call str {
        let value = unsafe { (self.vtable.method)(self.ctx) };
        utf8(self.bytes(value)).unwrap_or_default()
    }

    pub fn uri(&self) -> &'call str {
        let value = unsafe { (self.vtable.uri)(self.ctx) };
        utf8(self.bytes(value)).unwrap_or_default()
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&'call str> {
        let value = unsafe { (self.vtable.header)(self.ctx, FfiStr::from_text(name)) };
        utf8(self.bytes(value))
    }

    /// `None` when the request carried no body
    pub fn body(&self) -> Option<&'call [u8]> {
        let value = unsafe { (self.vtable.body)(self.ctx) };
        self.bytes(value)
    }

    pub fn body_text(&self) -> Option<Cow<'call, str>> {
        self.body().map(String::from_utf8_lossy)
    }
}

/// Request view handed to proxy routing. The URI may be rewritten, so reads
/// borrow the view instead of the call.
pub struct ProxyRequest<'call> {
    ctx: *mut c_void,
    vtable: &'call RequestVTable,
    set_uri: unsafe extern "C" fn(ctx: *mut c_void, uri: FfiStr),
    _call: PhantomData<&'call mut RawRequest>,
}

impl<'call> ProxyRequest<'call> {
    /// Wrap a raw handle. `None` also when the host did not grant `set_uri`.
    ///
    /// # Safety
    ///
    /// As for [`Request::from_raw`].
    pub unsafe fn from_raw(raw: *mut RawRequest) -> Option<Self> {
        let raw = unsafe { raw.as_mut() }?;
        debug_assert_eq!(raw.magic, HANDLE_LIVE, "request handle is not live");
        let vtable = unsafe { raw.vtable.as_ref() }?;
        Some(Self {
            ctx: raw.ctx,
            vtable,
            set_uri: vtable.set_uri?,
            _call: PhantomData,
        })
    }

    fn bytes(&self, value: FfiStr) -> Option<&[u8]> {
        unsafe { value.as_bytes() }
    }

    pub fn method(&self) -> &str {
        let value = unsafe { (self.vtable.method)(self.ctx) };
        utf8(self.bytes(value)).unwrap_or_default()
    }

    pub fn uri(&self) -> &str {
        let value = unsafe { (self.vtable.uri)(self.ctx) };
        utf8(self.bytes(value)).unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let value = unsafe { (self.vtable.header)(self.ctx, FfiStr::from_text(name)) };
        utf8(self.bytes(value))
    }

    pub fn body(&self) -> Option<&[u8]> {
        let value = unsafe { (self.vtable.body)(self.ctx) };
        self.bytes(value)
    }

    /// Replace the URI the host forwards upstream
    pub fn set_uri(&mut self, uri: &str) {
        unsafe { (self.set_uri)(self.ctx, FfiStr::from_text(uri)) }
    }
}

/// Write view of the current response
pub struct Response<'call> {
    ctx: *mut c_void,
    vtable: &'call ResponseVTable,
    _call: PhantomData<&'call mut RawResponse>,
}

impl<'call> Response<'call> {
    /// # Safety
    ///
    /// As for [`Request::from_raw`].
    pub unsafe fn from_raw(raw: *mut RawResponse) -> Option<Self> {
        let raw = unsafe { raw.as_mut() }?;
        debug_assert_eq!(raw.magic, HANDLE_LIVE, "response handle is not live");
        let vtable = unsafe { raw.vtable.as_ref() }?;
        Some(Self {
            ctx: raw.ctx,
            vtable,
            _call: PhantomData,
        })
    }

    /// `0` while unset
    pub fn status(&self) -> u16 {
        unsafe { (self.vtable.status)(self.ctx) }
    }

    pub fn set_status(&mut self, status: u16) {
        unsafe { (self.vtable.set_status)(self.ctx, status) }
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), HeaderRejected> {
        let code = unsafe {
            (self.vtable.set_header)(self.ctx, FfiStr::from_text(name), FfiStr::from_text(value))
        };
        if code == 0 {
            Ok(())
        } else {
            Err(HeaderRejected(name.to_string()))
        }
    }

    pub fn write_body(&mut self, bytes: &[u8]) {
        unsafe { (self.vtable.write_body)(self.ctx, FfiStr::from_bytes(bytes)) }
    }

    pub fn write_str(&mut self, text: &str) {
        self.write_body(text.as_bytes());
    }
}

/// Write the upstream address chosen by a proxy handler.
///
/// # Safety
///
/// `target` must be null or a live handle from the host for the current call.
pub(crate) unsafe fn set_proxy_target(target: *mut RawProxyTarget, address: &str) -> bool {
    let Some(target) = (unsafe { target.as_mut() }) else {
        return false;
    };
    debug_assert_eq!(target.magic, HANDLE_LIVE, "proxy target is not live");
    unsafe { (target.set)(target.ctx, FfiStr::from_text(address)) };
    true
}
