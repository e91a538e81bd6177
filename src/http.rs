//! Host-owned request and response data
//!
//! These are the contents behind the opaque handles. Modules never see these
//! types directly; they reach them through the vtables in [`crate::abi`].

use std::collections::HashMap;

use thiserror::Error;

/// Status used when a response leaves the pipeline without one.
pub const DEFAULT_STATUS: u16 = 200;

/// Rejected header name or value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Header name is empty")]
    EmptyName,

    #[error("Invalid character in header name: {0:?}")]
    InvalidName(String),

    #[error("Header value for '{0}' contains CR or LF")]
    InvalidValue(String),
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn validate_header(name: &str, value: &str) -> Result<(), HeaderError> {
    if name.is_empty() {
        return Err(HeaderError::EmptyName);
    }
    let token = |b: u8| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b);
    if !name.bytes().all(token) {
        return Err(HeaderError::InvalidName(name.to_string()));
    }
    if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(HeaderError::InvalidValue(name.to_string()));
    }
    Ok(())
}

/// An inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Builder-style header insertion
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Insert a header. Names are stored trimmed and lowercased; a later value
    /// replaces an earlier one.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(normalize_name(name), value.trim().to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&normalize_name(name)).map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// URI without the query string
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(p, _)| p)
    }

    pub fn query_string(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }
}

/// An outbound response, populated by modules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// `0` until something sets it
    pub status: u16,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<Option<String>, HeaderError> {
        let name = normalize_name(name);
        validate_header(&name, value)?;
        Ok(self.headers.insert(name, value.to_string()))
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&normalize_name(name))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&normalize_name(name)).map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn write_body(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn is_untouched(&self) -> bool {
        self.status == 0 && self.headers.is_empty() && self.body.is_empty()
    }

    /// Apply `default_status` if no module set one.
    pub fn finalize(&mut self, default_status: u16) {
        if self.status == 0 {
            self.status = default_status;
        }
    }
}
