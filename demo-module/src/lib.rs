//! modhost Demo Module
//!
//! Reference module built as a `cdylib`. Every request gets a fixed
//! `404 Hello World!` response and one diagnostic line describing it; the
//! proxy hook routes `/<upstream>/<rest>` to `<upstream>` with the URI
//! rewritten to `/<rest>`.
//!
//! ```text
//! modhost call target/debug/libmodhost_demo.so -H "User-Agent: curl/8"
//! modhost call target/debug/libmodhost_demo.so --proxy --uri /backend:8080/api
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use modhost::module::{Handler, ProxyRequest, Request, Response};
use parking_lot::Mutex;

/// Where diagnostic lines go
pub type Sink = Box<dyn Write + Send>;

pub struct DemoHandler {
    /// Serializes diagnostic lines from concurrent calls
    sink: Mutex<Sink>,
    served: AtomicU64,
}

impl DemoHandler {
    pub fn with_sink(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
            served: AtomicU64::new(0),
        }
    }

    /// Requests answered by this load generation
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    fn emit(&self, line: &str) {
        let mut sink = self.sink.lock();
        if let Err(e) = writeln!(sink, "{}", line).and_then(|_| sink.flush()) {
            tracing::warn!(error = %e, "diagnostic write failed");
        }
    }
}

/// One diagnostic line per request, values quoted and escaped.
pub fn describe_request(method: &str, uri: &str, user_agent: &str, body: &str) -> String {
    format!(
        "Method: {:?}, Uri: {:?}, User-Agent: {:?}, Body: {:?}",
        method, uri, user_agent, body
    )
}

/// Split `/<upstream>/<rest>` into the upstream address and the rewritten URI.
///
/// `None` when the URI names no upstream.
pub fn route(uri: &str) -> Option<(&str, String)> {
    let mut parts = uri.splitn(3, '/');
    parts.next();
    let address = parts.next().filter(|address| !address.is_empty())?;
    let rest = format!("/{}", parts.next().unwrap_or(""));
    Some((address, rest))
}

impl Handler for DemoHandler {
    fn init() -> anyhow::Result<Self> {
        Ok(Self::with_sink(Box::new(std::io::stdout())))
    }

    fn handle(&self, req: &Request<'_>, resp: &mut Response<'_>) {
        if let Err(e) = resp.set_header("hello", "world") {
            tracing::warn!(error = %e, "header not set");
        }
        resp.write_str("Hello World!\n");
        resp.set_status(404);

        let body = req.body_text().unwrap_or_default();
        self.emit(&describe_request(
            req.method(),
            req.uri(),
            req.header("User-Agent").unwrap_or_default(),
            &body,
        ));
        self.served.fetch_add(1, Ordering::Relaxed);
    }

    fn proxy(&self, req: &mut ProxyRequest<'_>, _resp: &mut Response<'_>) -> Option<String> {
        let (address, rest) = route(req.uri())?;
        let address = address.to_string();
        req.set_uri(&rest);
        self.served.fetch_add(1, Ordering::Relaxed);
        Some(address)
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        let served = self.served();
        self.emit(&format!("Unloading after {} requests", served));
        Ok(())
    }
}

modhost::export_module!(DemoHandler);
