/// Define the entry points for a [`Handler`](crate::module::Handler) inside a
/// named Rust module, without exporting any symbols.
///
/// Each invocation gets its own [`ModuleContext`](crate::module::ModuleContext),
/// so several modules can be hosted in one process (tests, statically linked
/// modules) via `entry_points()`.
///
/// ```ignore
/// modhost::declare_module!(pub mod echo => EchoHandler);
/// let instance = ModuleInstance::from_entry_points("echo", echo::entry_points())?;
/// ```
#[macro_export]
macro_rules! declare_module {
    ($vis:vis mod $name:ident => $handler:ty) => {
        #[allow(dead_code)]
        $vis mod $name {
            #[allow(unused_imports)]
            use super::*;

            static CONTEXT: $crate::module::ModuleContext<$handler> =
                $crate::module::ModuleContext::new();

            pub fn context() -> &'static $crate::module::ModuleContext<$handler> {
                &CONTEXT
            }

            /// # Safety
            ///
            /// Host-provided handles, live for this call.
            pub unsafe extern "C" fn handle_request(
                request: *const $crate::abi::RawRequest,
                response: *mut $crate::abi::RawResponse,
            ) {
                unsafe { CONTEXT.handle_request(request, response) }
            }

            /// # Safety
            ///
            /// Host-provided handles, live for this call.
            pub unsafe extern "C" fn handle_proxy_request(
                request: *mut $crate::abi::RawRequest,
                response: *mut $crate::abi::RawResponse,
                target: *mut $crate::abi::RawProxyTarget,
            ) {
                unsafe { CONTEXT.handle_proxy_request(request, response, target) }
            }

            pub extern "C" fn on_load() -> i32 {
                CONTEXT.load()
            }

            pub extern "C" fn on_unload() {
                CONTEXT.unload()
            }

            pub extern "C" fn abi_version() -> u32 {
                $crate::abi::ABI_VERSION
            }

            pub fn entry_points() -> $crate::abi::EntryPoints {
                $crate::abi::EntryPoints {
                    handle_request,
                    handle_proxy_request: Some(handle_proxy_request),
                    on_load: Some(on_load),
                    on_unload: Some(on_unload),
                    abi_version: Some(abi_version),
                }
            }
        }
    };
}

/// Export the ABI entry points for a [`Handler`](crate::module::Handler).
///
/// Use once per `cdylib`. Emits `HandleRequest`, `HandleProxyRequest`,
/// `OnLoad`, `OnUnload` and `ModuleAbiVersion` as unmangled symbols, plus a
/// `module_entry_points()` function for hosting the same module in-process.
#[macro_export]
macro_rules! export_module {
    ($handler:ty) => {
        $crate::declare_module!(mod __modhost_exports => $handler);

        #[allow(non_snake_case)]
        #[no_mangle]
        pub unsafe extern "C" fn HandleRequest(
            request: *const $crate::abi::RawRequest,
            response: *mut $crate::abi::RawResponse,
        ) {
            unsafe { __modhost_exports::handle_request(request, response) }
        }

        #[allow(non_snake_case)]
        #[no_mangle]
        pub unsafe extern "C" fn HandleProxyRequest(
            request: *mut $crate::abi::RawRequest,
            response: *mut $crate::abi::RawResponse,
            target: *mut $crate::abi::RawProxyTarget,
        ) {
            unsafe { __modhost_exports::handle_proxy_request(request, response, target) }
        }

        #[allow(non_snake_case)]
        #[no_mangle]
        pub extern "C" fn OnLoad() -> i32 {
            __modhost_exports::on_load()
        }

        #[allow(non_snake_case)]
        #[no_mangle]
        pub extern "C" fn OnUnload() {
            __modhost_exports::on_unload()
        }

        #[allow(non_snake_case)]
        #[no_mangle]
        pub extern "C" fn ModuleAbiVersion() -> u32 {
            __modhost_exports::abi_version()
        }

        /// Entry points of this module, for in-process hosting.
        pub fn module_entry_points() -> $crate::abi::EntryPoints {
            __modhost_exports::entry_points()
        }

        /// Process-wide state of this module.
        pub fn module_context() -> &'static $crate::module::ModuleContext<$handler> {
            __modhost_exports::context()
        }
    };
}
