//! Firestore adapter implementing the `Connector`/`Connection` ports.
//!
//! Talks to the Firestore REST v1 API.
//! - `FirebaseApp` is the authenticated application handle. It is built once
//!   from a project id and a JSON service-account key and hands out one
//!   connection per operation.
//! - Each connection carries its own HTTP client and bearer token and is
//!   released by closing it (the HTTP client is dropped).
//! - Upserts are PATCH requests whose update mask lists every leaf field of
//!   the payload, so fields not in the payload are left alone.
//!
//! Notes:
//! - The domain ports are synchronous. We bridge to async `reqwest` per call:
//!   the caller's runtime when it is multi-threaded, otherwise a lazily built
//!   runtime owned by the app (see `runtime.rs`).
//! - A 401 from Firestore drops the cached access token, so the next
//!   connection mints a fresh one. The failed call is not retried.
//! - `with_emulator` targets a local Firestore emulator, which accepts the
//!   static bearer token `owner` and needs no credentials.

mod codec;
mod runtime;

pub use codec::{decode_fields, encode_fields, quote_segment, update_mask};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use domain::{
    CallContext, Connection, Connector, Document, DocumentAddress, InitError, RemoteError,
    StoreError,
};
use google_auth::{AuthError, ServiceAccountKey, TokenSource, DATASTORE_SCOPE};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tracing::{debug, trace, warn};

use runtime::Bridge;

pub const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com";
pub const DEFAULT_DATABASE: &str = "(default)";
const EMULATOR_TOKEN: &str = "owner";

#[derive(Clone)]
enum Auth {
    ServiceAccount(Arc<TokenSource>),
    Emulator,
}

/// Authenticated handle to one Firestore database.
#[derive(Clone)]
pub struct FirebaseApp {
    project_id: String,
    database_id: String,
    base_url: Url,
    auth: Auth,
    bridge: Bridge,
}

impl fmt::Debug for FirebaseApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirebaseApp")
            .field("project_id", &self.project_id)
            .field("database_id", &self.database_id)
            .field("base_url", &self.base_url.as_str())
            .field("emulator", &self.is_emulator())
            .finish_non_exhaustive()
    }
}

fn init_err(msg: impl Into<String>) -> StoreError {
    StoreError::Initialization(InitError::new(msg))
}

fn credentials_err(e: AuthError) -> StoreError {
    StoreError::Initialization(InitError::with_source("invalid service account credentials", e))
}

impl FirebaseApp {
    /// Build the app handle from a project id and a JSON service-account key.
    ///
    /// An empty `project_id` falls back to the key's own `project_id`.
    pub fn new(project_id: &str, credentials_json: &[u8]) -> Result<Self, StoreError> {
        let key = ServiceAccountKey::from_json(credentials_json).map_err(credentials_err)?;
        let project_id = if project_id.is_empty() {
            key.project_id.clone().unwrap_or_default()
        } else {
            project_id.to_string()
        };
        if project_id.is_empty() {
            return Err(init_err("missing project id"));
        }
        let source = TokenSource::new(key, &[DATASTORE_SCOPE]).map_err(credentials_err)?;
        debug!(
            project_id = %project_id,
            client_email = %source.key().client_email,
            "firestore: app initialized"
        );
        Self::build(project_id, Auth::ServiceAccount(Arc::new(source)), DEFAULT_BASE_URL)
    }

    /// Build an app handle against a Firestore emulator at `host` (`host:port`).
    pub fn with_emulator(project_id: &str, host: &str) -> Result<Self, StoreError> {
        if project_id.is_empty() {
            return Err(init_err("missing project id"));
        }
        warn!(host = %host, "firestore: using emulator, requests are not authenticated");
        Self::build(project_id.to_string(), Auth::Emulator, &format!("http://{host}"))
    }

    fn build(project_id: String, auth: Auth, base_url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            project_id,
            database_id: DEFAULT_DATABASE.to_string(),
            base_url: parse_base_url(base_url)?,
            auth,
            bridge: Bridge::new(),
        })
    }

    /// Target a named database instead of `(default)`.
    pub fn with_database(mut self, database_id: impl Into<String>) -> Self {
        self.database_id = database_id.into();
        self
    }

    /// Send requests to another endpoint (regional endpoint, proxy, test server).
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, StoreError> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn is_emulator(&self) -> bool {
        matches!(self.auth, Auth::Emulator)
    }

    fn token_source(&self) -> Option<Arc<TokenSource>> {
        match &self.auth {
            Auth::ServiceAccount(source) => Some(Arc::clone(source)),
            Auth::Emulator => None,
        }
    }

    fn bearer_token(&self, ctx: &CallContext) -> Result<String, RemoteError> {
        match &self.auth {
            Auth::Emulator => Ok(EMULATOR_TOKEN.to_string()),
            Auth::ServiceAccount(source) => {
                let source = Arc::clone(source);
                let tok = self.bridge.run(ctx.timeout(), async move {
                    source.token().await.map_err(auth_to_remote)
                })?;
                Ok(tok.token)
            }
        }
    }

    /// `{base}/v1/projects/{project}/databases/{database}/documents`
    fn documents_root(&self) -> Url {
        let mut url = self.base_url.clone();
        // parse_base_url rejects cannot-be-a-base URLs
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty().extend([
                "v1",
                "projects",
                self.project_id.as_str(),
                "databases",
                self.database_id.as_str(),
                "documents",
            ]);
        }
        url
    }
}

fn parse_base_url(raw: &str) -> Result<Url, StoreError> {
    let url = Url::parse(raw).map_err(|e| init_err(format!("invalid base url {raw:?}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(init_err(format!("invalid base url {raw:?}")));
    }
    Ok(url)
}

impl Connector for FirebaseApp {
    type Conn = FirestoreConnection;

    fn connect(&self, ctx: &CallContext) -> Result<FirestoreConnection, RemoteError> {
        let token = self.bearer_token(ctx)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RemoteError::Transport(format!("http client: {e}")))?;
        debug!(project_id = %self.project_id, database = %self.database_id, "firestore: connection opened");
        Ok(FirestoreConnection {
            http: Some(http),
            token,
            tokens: self.token_source(),
            root: self.documents_root(),
            timeout: ctx.timeout(),
            bridge: self.bridge.clone(),
        })
    }
}

fn auth_to_remote(e: AuthError) -> RemoteError {
    match e {
        AuthError::Network(msg) => RemoteError::Transport(msg),
        AuthError::InvalidResponse(msg) => RemoteError::Decode(msg),
        AuthError::TokenRejected { status: 403, message } => RemoteError::PermissionDenied(message),
        AuthError::TokenRejected {
            status: 400 | 401,
            message,
        } => RemoteError::Unauthenticated(message),
        AuthError::TokenRejected { status, message } => RemoteError::Status {
            code: status,
            message,
        },
        other => RemoteError::Unauthenticated(other.to_string()),
    }
}

/// One scoped connection to Firestore.
pub struct FirestoreConnection {
    // None once closed
    http: Option<reqwest::Client>,
    token: String,
    // None for the emulator
    tokens: Option<Arc<TokenSource>>,
    root: Url,
    timeout: Option<Duration>,
    bridge: Bridge,
}

#[derive(Debug, Deserialize)]
struct DocumentBody {
    #[serde(default)]
    fields: Option<Json>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl FirestoreConnection {
    fn document_url(&self, address: &DocumentAddress) -> Url {
        let mut url = self.root.clone();
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.extend([address.collection(), address.document()]);
        }
        url
    }

    /// Send one request and return the status with the raw body.
    fn call(
        &self,
        method: Method,
        url: Url,
        body: Option<Json>,
    ) -> Result<(StatusCode, String), RemoteError> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| RemoteError::Transport("connection already closed".into()))?;
        trace!(method = %method, url = %url, "firestore: request");
        let mut req = http.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        self.bridge.run(self.timeout, async move {
            let resp = req
                .send()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            Ok::<_, RemoteError>((status, text))
        })
    }

    /// Map a failed response, dropping the cached token if Firestore refused it.
    fn reject(&self, status: StatusCode, body: &str) -> RemoteError {
        let err = status_error(status, body);
        if let (RemoteError::Unauthenticated(_), Some(source)) = (&err, &self.tokens) {
            source.invalidate();
            debug!("firestore: access token refused, cleared cached token");
        }
        err
    }
}

/// Map a non-success response to the remote error taxonomy.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let (message, code_name) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => (env.error.message, env.error.status),
        Err(_) => (body.to_string(), String::new()),
    };
    if code_name == "DEADLINE_EXCEEDED" {
        return RemoteError::DeadlineExceeded;
    }
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::FORBIDDEN => RemoteError::PermissionDenied(message),
        StatusCode::UNAUTHORIZED => RemoteError::Unauthenticated(message),
        StatusCode::GATEWAY_TIMEOUT => RemoteError::DeadlineExceeded,
        other => RemoteError::Status {
            code: other.as_u16(),
            message,
        },
    }
}

/// The precondition `currentDocument.exists=false` failed, i.e. the document
/// is already there.
fn already_exists(body: &str) -> bool {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|env| matches!(env.error.status.as_str(), "ALREADY_EXISTS" | "FAILED_PRECONDITION"))
        .unwrap_or(false)
}

impl Connection for FirestoreConnection {
    fn get(&mut self, address: &DocumentAddress) -> Result<Document, RemoteError> {
        let (status, body) = self.call(Method::GET, self.document_url(address), None)?;
        if !status.is_success() {
            return Err(self.reject(status, &body));
        }
        let doc: DocumentBody = serde_json::from_str(&body)
            .map_err(|e| RemoteError::Decode(format!("document body: {e}")))?;
        match doc.fields {
            Some(fields) => decode_fields(&fields),
            None => Ok(Document::new()),
        }
    }

    fn delete(&mut self, address: &DocumentAddress) -> Result<(), RemoteError> {
        let (status, body) = self.call(Method::DELETE, self.document_url(address), None)?;
        if !status.is_success() {
            return Err(self.reject(status, &body));
        }
        Ok(())
    }

    fn merge_set(
        &mut self,
        address: &DocumentAddress,
        payload: &Document,
    ) -> Result<(), RemoteError> {
        let mut url = self.document_url(address);
        let mask = update_mask(payload);
        if mask.is_empty() {
            // No fields to touch: create the document only if it is absent.
            url.query_pairs_mut()
                .append_pair("currentDocument.exists", "false");
            let (status, body) = self.call(Method::PATCH, url, Some(json!({})))?;
            if status.is_success() || status == StatusCode::CONFLICT || already_exists(&body) {
                return Ok(());
            }
            return Err(self.reject(status, &body));
        }

        {
            let mut pairs = url.query_pairs_mut();
            for path in &mask {
                pairs.append_pair("updateMask.fieldPaths", path);
            }
        }
        let body = json!({ "fields": encode_fields(payload) });
        let (status, resp) = self.call(Method::PATCH, url, Some(body))?;
        if !status.is_success() {
            return Err(self.reject(status, &resp));
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.http.take().is_some() {
            debug!("firestore: connection released");
        }
    }
}
