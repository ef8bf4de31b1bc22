use std::ops::{Deref, DerefMut};

use crate::{
    CallContext, Connection, Connector, Document, DocumentAddress, OpKind, StoreError,
};

/// Owns a connection for the span of one operation and closes it on drop,
/// whichever way the operation exits.
pub struct ConnectionGuard<C: Connection> {
    conn: C,
}

impl<C: Connection> ConnectionGuard<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

impl<C: Connection> Deref for ConnectionGuard<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: Connection> DerefMut for ConnectionGuard<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: Connection> Drop for ConnectionGuard<C> {
    fn drop(&mut self) {
        self.conn.close();
    }
}

/// Document store adapter: get, delete and upsert scoped by
/// `(collection, document)`.
///
/// Each call opens a fresh connection through the connector, issues exactly
/// one remote call, and releases the connection before returning. The store
/// keeps no state besides the connector and the call context, so calls are
/// independent of each other.
pub struct DocumentStore<K: Connector> {
    connector: K,
    ctx: CallContext,
}

impl<K: Connector> DocumentStore<K> {
    pub fn new(connector: K) -> Self {
        Self::with_context(connector, CallContext::default())
    }

    pub fn with_context(connector: K, ctx: CallContext) -> Self {
        Self { connector, ctx }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn acquire(&self) -> Result<ConnectionGuard<K::Conn>, StoreError> {
        let conn = self
            .connector
            .connect(&self.ctx)
            .map_err(StoreError::Connection)?;
        Ok(ConnectionGuard::new(conn))
    }

    /// Fetch the fields of a document.
    ///
    /// An absent document is an `Operation` error; use
    /// [`StoreError::is_not_found`] to tell it apart from other failures.
    pub fn get(&self, collection: &str, document: &str) -> Result<Document, StoreError> {
        let address = DocumentAddress::new(collection, document)?;
        let mut conn = self.acquire()?;
        conn.get(&address)
            .map_err(|source| StoreError::operation(OpKind::Get, address, source))
    }

    /// Delete a document.
    pub fn delete(&self, collection: &str, document: &str) -> Result<(), StoreError> {
        let address = DocumentAddress::new(collection, document)?;
        let mut conn = self.acquire()?;
        conn.delete(&address)
            .map_err(|source| StoreError::operation(OpKind::Delete, address, source))
    }

    /// Merge `payload` into a document, creating it when absent.
    pub fn upsert(
        &self,
        collection: &str,
        document: &str,
        payload: &Document,
    ) -> Result<(), StoreError> {
        let address = DocumentAddress::new(collection, document)?;
        let mut conn = self.acquire()?;
        conn.merge_set(&address, payload)
            .map_err(|source| StoreError::operation(OpKind::Upsert, address, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::InMemoryConnector;
    use crate::{FieldValue, RemoteError};

    fn doc(pairs: &[(&str, FieldValue)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn upsert_merges_fields_across_writes() {
        let store = DocumentStore::new(InMemoryConnector::new());
        store
            .upsert("users", "42", &doc(&[("name", "Ana".into())]))
            .unwrap();
        store
            .upsert("users", "42", &doc(&[("age", 30.into())]))
            .unwrap();

        let got = store.get("users", "42").unwrap();
        assert_eq!(got, doc(&[("name", "Ana".into()), ("age", 30.into())]));
    }

    #[test]
    fn upsert_overwrites_overlapping_keys() {
        let store = DocumentStore::new(InMemoryConnector::new());
        store
            .upsert("users", "7", &doc(&[("name", "Ana".into()), ("city", "Oslo".into())]))
            .unwrap();
        store
            .upsert("users", "7", &doc(&[("city", "Bergen".into())]))
            .unwrap();

        let got = store.get("users", "7").unwrap();
        assert_eq!(got["city"].as_str(), Some("Bergen"));
        assert_eq!(got["name"].as_str(), Some("Ana"));
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = DocumentStore::new(InMemoryConnector::new());
        let payload = doc(&[("name", "Ana".into()), ("active", true.into())]);
        store.upsert("users", "1", &payload).unwrap();
        let once = store.get("users", "1").unwrap();
        store.upsert("users", "1", &payload).unwrap();
        let twice = store.get("users", "1").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn read_missing_is_operation_error() {
        let store = DocumentStore::new(InMemoryConnector::new());
        let err = store.get("users", "missing").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Operation {
                op: OpKind::Get,
                ..
            }
        ));
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_then_read_fails() {
        let store = DocumentStore::new(InMemoryConnector::new());
        store
            .upsert("users", "9", &doc(&[("name", "Bo".into())]))
            .unwrap();
        store.delete("users", "9").unwrap();
        let err = store.get("users", "9").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn each_operation_releases_exactly_once() {
        let connector = InMemoryConnector::new();
        let stats = connector.stats();
        let store = DocumentStore::new(connector);

        store
            .upsert("users", "1", &doc(&[("a", 1.into())]))
            .unwrap();
        store.get("users", "1").unwrap();
        store.delete("users", "1").unwrap();
        // fails remotely but must still release
        let _ = store.get("users", "1").unwrap_err();

        assert_eq!(stats.acquired(), 4);
        assert_eq!(stats.released(), 4);
    }

    #[test]
    fn injected_operation_failure_still_releases() {
        let connector = InMemoryConnector::new();
        let stats = connector.stats();
        connector.fail_operations_with(Some(RemoteError::PermissionDenied("nope".into())));
        let store = DocumentStore::new(connector);

        let err = store
            .upsert("users", "1", &doc(&[("a", 1.into())]))
            .unwrap_err();
        match err {
            StoreError::Operation { op, source, .. } => {
                assert_eq!(op, OpKind::Upsert);
                assert!(matches!(source, RemoteError::PermissionDenied(_)));
            }
            other => panic!("expected operation error, got {other:?}"),
        }
        assert_eq!(stats.acquired(), 1);
        assert_eq!(stats.released(), 1);
    }

    #[test]
    fn connect_failure_aborts_without_effect() {
        let connector = InMemoryConnector::new();
        let stats = connector.stats();
        connector.fail_connect_with(Some(RemoteError::Transport("refused".into())));
        let store = DocumentStore::new(connector);

        let err = store
            .upsert("users", "1", &doc(&[("a", 1.into())]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        assert_eq!(stats.acquired(), 0);
        assert_eq!(stats.released(), 0);

        store.connector().fail_connect_with(None);
        assert!(store.get("users", "1").unwrap_err().is_not_found());
    }

    #[test]
    fn invalid_address_never_connects() {
        let connector = InMemoryConnector::new();
        let stats = connector.stats();
        let store = DocumentStore::new(connector);
        let err = store.delete("users", "").unwrap_err();
        assert!(matches!(err, StoreError::InvalidAddress(_)));
        assert_eq!(stats.acquired(), 0);
    }

    #[test]
    fn context_is_kept_for_every_call() {
        let ctx = CallContext::with_timeout(std::time::Duration::from_secs(5));
        let store = DocumentStore::with_context(InMemoryConnector::new(), ctx.clone());
        assert_eq!(store.context(), &ctx);
        store.get("users", "x").unwrap_err();
        assert_eq!(store.connector().last_context(), Some(ctx));
    }
}
