use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{
    CallContext, Connection, Connector, Document, DocumentAddress, FieldValue, RemoteError,
};

type Docs = Arc<Mutex<BTreeMap<DocumentAddress, Document>>>;

/// Acquire/release accounting shared between a connector and its connections.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ConnectionStats {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Connections handed out and not yet closed.
    pub fn open(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

/// In-memory stand-in for the remote document service. Honors the same
/// merge-write contract and counts every acquire and release so tests can
/// check the scoped-connection discipline. Failures can be injected for both
/// connect and the remote call.
pub struct InMemoryConnector {
    docs: Docs,
    stats: Arc<ConnectionStats>,
    fail_connect: Mutex<Option<RemoteError>>,
    fail_ops: Mutex<Option<RemoteError>>,
    last_ctx: Mutex<Option<CallContext>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self {
            docs: Arc::new(Mutex::new(BTreeMap::new())),
            stats: Arc::new(ConnectionStats::default()),
            fail_connect: Mutex::new(None),
            fail_ops: Mutex::new(None),
            last_ctx: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Make every following `connect` fail with `err` (or succeed again with `None`).
    pub fn fail_connect_with(&self, err: Option<RemoteError>) {
        *lock(&self.fail_connect) = err;
    }

    /// Make every remote call on connections opened from now on fail with `err`.
    pub fn fail_operations_with(&self, err: Option<RemoteError>) {
        *lock(&self.fail_ops) = err;
    }

    /// Context passed to the most recent `connect`.
    pub fn last_context(&self) -> Option<CallContext> {
        lock(&self.last_ctx).clone()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        lock(&self.docs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for InMemoryConnector {
    type Conn = InMemoryConnection;

    fn connect(&self, ctx: &CallContext) -> Result<InMemoryConnection, RemoteError> {
        *lock(&self.last_ctx) = Some(ctx.clone());
        if let Some(err) = lock(&self.fail_connect).clone() {
            return Err(err);
        }
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryConnection {
            docs: Arc::clone(&self.docs),
            stats: Arc::clone(&self.stats),
            fail: lock(&self.fail_ops).clone(),
        })
    }
}

pub struct InMemoryConnection {
    docs: Docs,
    stats: Arc<ConnectionStats>,
    fail: Option<RemoteError>,
}

impl InMemoryConnection {
    fn check(&self) -> Result<(), RemoteError> {
        match &self.fail {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Connection for InMemoryConnection {
    fn get(&mut self, address: &DocumentAddress) -> Result<Document, RemoteError> {
        self.check()?;
        lock(&self.docs)
            .get(address)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    fn delete(&mut self, address: &DocumentAddress) -> Result<(), RemoteError> {
        self.check()?;
        lock(&self.docs).remove(address);
        Ok(())
    }

    fn merge_set(
        &mut self,
        address: &DocumentAddress,
        payload: &Document,
    ) -> Result<(), RemoteError> {
        self.check()?;
        let mut docs = lock(&self.docs);
        let target = docs.entry(address.clone()).or_default();
        merge_fields(target, payload);
        Ok(())
    }

    fn close(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Merge `incoming` into `target` leaf by leaf: non-empty nested maps are
/// merged recursively, everything else replaces the existing value.
pub fn merge_fields(target: &mut Document, incoming: &Document) {
    for (key, value) in incoming {
        match value {
            FieldValue::Map(nested) if !nested.is_empty() => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| FieldValue::Map(Document::new()));
                if !matches!(slot, FieldValue::Map(_)) {
                    *slot = FieldValue::Map(Document::new());
                }
                if let FieldValue::Map(existing) = slot {
                    merge_fields(existing, nested);
                }
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

// A poisoned lock only means another test thread panicked mid-write; the map
// itself is still usable.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
