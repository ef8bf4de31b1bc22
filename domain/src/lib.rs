//! Domain library for the document store adapter.
//!
//! This crate holds the addressing and payload types, the connection ports
//! (traits), and error definitions. Keep remote IO and credential handling out
//! of this crate; those live in the adapter crates.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// A document body: field name to value.
pub type Document = BTreeMap<String, FieldValue>;

/// Two-level address of a single document: `collection/document`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentAddress {
    collection: String,
    document: String,
}

impl DocumentAddress {
    pub fn new<C: Into<String>, D: Into<String>>(
        collection: C,
        document: D,
    ) -> Result<Self, StoreError> {
        let collection = collection.into();
        let document = document.into();
        validate_segment("collection", &collection)?;
        validate_segment("document", &document)?;
        Ok(Self {
            collection,
            document,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn document(&self) -> &str {
        &self.document
    }
}

impl Display for DocumentAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.document)
    }
}

fn validate_segment(kind: &str, val: &str) -> Result<(), StoreError> {
    if val.is_empty() {
        return Err(StoreError::InvalidAddress(format!("empty {kind} name")));
    }
    // A slash would silently change the addressing level.
    if val.contains('/') {
        return Err(StoreError::InvalidAddress(format!(
            "{kind} name {val:?} contains '/'"
        )));
    }
    if val == "." || val == ".." {
        return Err(StoreError::InvalidAddress(format!(
            "{kind} name {val:?} is reserved"
        )));
    }
    Ok(())
}

/// Per-call settings shared by every operation of a store.
///
/// Passed explicitly at construction so the deadline scope is visible to the
/// caller instead of hiding in process-wide state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallContext {
    timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every remote round trip by `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// The remote operation a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Delete,
    Upsert,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Get => "get",
            OpKind::Delete => "delete",
            OpKind::Upsert => "upsert",
        }
    }
}

/// Opens short-lived connections to the document service.
///
/// Implementors hold the authenticated application handle. Every call to
/// [`Connector::connect`] hands out a fresh connection owned by the caller.
pub trait Connector: Send + Sync {
    type Conn: Connection;

    fn connect(&self, ctx: &CallContext) -> Result<Self::Conn, RemoteError>;
}

/// A single scoped connection. Exactly one remote call is issued through it
/// before [`Connection::close`] is called.
pub trait Connection {
    /// Fetch the fields of the document at `address`.
    fn get(&mut self, address: &DocumentAddress) -> Result<Document, RemoteError>;
    /// Remove the document at `address`.
    fn delete(&mut self, address: &DocumentAddress) -> Result<(), RemoteError>;
    /// Write `payload` with merge semantics: listed fields overwrite, other
    /// existing fields are kept, an absent document is created.
    fn merge_set(&mut self, address: &DocumentAddress, payload: &Document)
        -> Result<(), RemoteError>;
    /// Release the underlying resources.
    fn close(&mut self);
}

/// Failure reported by the remote service or the path to it.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteError {
    NotFound,
    PermissionDenied(String),
    Unauthenticated(String),
    DeadlineExceeded,
    Status { code: u16, message: String },
    Transport(String),
    Decode(String),
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::NotFound => write!(f, "document not found"),
            RemoteError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            RemoteError::Unauthenticated(msg) => write!(f, "unauthenticated: {}", msg),
            RemoteError::DeadlineExceeded => write!(f, "deadline exceeded"),
            RemoteError::Status { code, message } => {
                write!(f, "remote status {}: {}", code, message)
            }
            RemoteError::Transport(msg) => write!(f, "transport error: {}", msg),
            RemoteError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl Error for RemoteError {}

/// Why an app handle could not be built, with the underlying cause if any.
#[derive(Debug)]
pub struct InitError {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl InitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    fn cause(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

impl Display for InitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => f.write_str(&self.message),
        }
    }
}

impl From<&str> for InitError {
    fn from(message: &str) -> Self {
        InitError::new(message)
    }
}

impl From<String> for InitError {
    fn from(message: String) -> Self {
        InitError::new(message)
    }
}

/// Errors surfaced to callers of the document store.
#[derive(Debug)]
pub enum StoreError {
    /// Credential parsing or handshake failed while building the app handle.
    Initialization(InitError),
    /// No connection could be obtained; nothing was sent.
    Connection(RemoteError),
    /// The remote call itself failed.
    Operation {
        op: OpKind,
        address: DocumentAddress,
        source: RemoteError,
    },
    InvalidAddress(String),
}

impl StoreError {
    pub fn operation(op: OpKind, address: DocumentAddress, source: RemoteError) -> Self {
        StoreError::Operation {
            op,
            address,
            source,
        }
    }

    /// True when the remote service reported the document as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::Operation {
                source: RemoteError::NotFound,
                ..
            }
        )
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Initialization(e) => write!(f, "error initializing app: {}", e),
            StoreError::Connection(e) => write!(f, "error connecting to document service: {}", e),
            StoreError::Operation {
                op,
                address,
                source,
            } => write!(f, "{} {} failed: {}", op.as_str(), address, source),
            StoreError::InvalidAddress(msg) => write!(f, "invalid document address: {}", msg),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Initialization(e) => e.cause(),
            StoreError::Connection(e) => Some(e),
            StoreError::Operation { source, .. } => Some(source),
            StoreError::InvalidAddress(_) => None,
        }
    }
}

pub mod adapters;
pub mod service;
pub mod value;

pub use service::DocumentStore;
pub use value::FieldValue;
