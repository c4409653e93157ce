// Process-wide registry mapping in-flight request ids to their cancellation
// controls. Entries live exactly as long as the request they belong to.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;

/// Shared cancellation flag checked at loop boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wakes the owning request task so it can tear down in-flight upstream I/O.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    notify: Arc<Notify>,
    reason: Arc<RwLock<Option<String>>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the owner. Safe to call repeatedly; the first reason wins.
    pub fn abort(&self, reason: &str) {
        if let Ok(mut slot) = self.reason.write() {
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Resolves when `abort` is called. Used with `tokio::select!` to drop
    /// in-flight upstream futures.
    pub async fn aborted(&self) {
        if self.reason().is_some() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct AbortEntry {
    pub cancel: CancelFlag,
    pub handle: AbortHandle,
    /// Owner; `None` means any caller may abort.
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Concurrent map from client request id to abort controls.
#[derive(Debug, Clone, Default)]
pub struct AbortRegistry {
    inner: Arc<RwLock<HashMap<String, AbortEntry>>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the controls for a request. No-op on an empty request id;
    /// re-registration overwrites.
    pub fn register(
        &self,
        request_id: &str,
        cancel: CancelFlag,
        handle: AbortHandle,
        user_id: Option<String>,
    ) {
        if request_id.is_empty() {
            return;
        }
        let entry = AbortEntry {
            cancel,
            handle,
            user_id,
            created_at: Utc::now(),
        };
        if let Ok(mut map) = self.inner.write() {
            map.insert(request_id.to_string(), entry);
        }
    }

    pub fn unregister(&self, request_id: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(request_id);
        }
    }

    pub fn lookup(&self, request_id: &str) -> Option<AbortEntry> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(request_id).cloned())
    }

    /// Abort the stream registered under `request_id` on behalf of
    /// `requesting_user_id`.
    ///
    /// Authorized iff the entry is unowned or owned by the requester.
    /// Aborting twice is allowed and returns true both times.
    pub fn abort(&self, request_id: &str, requesting_user_id: Option<&str>) -> bool {
        let Some(entry) = self.lookup(request_id) else {
            return false;
        };

        if let Some(owner) = &entry.user_id {
            if requesting_user_id != Some(owner.as_str()) {
                return false;
            }
        }

        entry.cancel.cancel();
        entry.handle.abort("client_stop");
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_owned(registry: &AbortRegistry, id: &str, owner: Option<&str>) -> CancelFlag {
        let flag = CancelFlag::new();
        registry.register(id, flag.clone(), AbortHandle::new(), owner.map(String::from));
        flag
    }

    #[test]
    fn test_register_empty_id_is_noop() {
        let registry = AbortRegistry::new();
        register_owned(&registry, "", None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_abort_unowned_entry_by_anyone() {
        let registry = AbortRegistry::new();
        let flag = register_owned(&registry, "req-1", None);
        assert!(registry.abort("req-1", Some("someone")));
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_abort_requires_matching_owner() {
        let registry = AbortRegistry::new();
        let flag = register_owned(&registry, "req-1", Some("alice"));

        assert!(!registry.abort("req-1", Some("bob")));
        assert!(!registry.abort("req-1", None));
        assert!(!flag.is_cancelled());

        assert!(registry.abort("req-1", Some("alice")));
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_abort_is_idempotent() {
        let registry = AbortRegistry::new();
        register_owned(&registry, "req-1", None);
        assert!(registry.abort("req-1", None));
        assert!(registry.abort("req-1", None));
    }

    #[test]
    fn test_abort_unknown_id() {
        let registry = AbortRegistry::new();
        assert!(!registry.abort("missing", None));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = AbortRegistry::new();
        let first = register_owned(&registry, "req-1", Some("alice"));
        let second = register_owned(&registry, "req-1", None);

        assert!(registry.abort("req-1", Some("anyone")));
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_unregister_removes_entry() {
        let registry = AbortRegistry::new();
        register_owned(&registry, "req-1", None);
        registry.unregister("req-1");
        assert!(registry.lookup("req-1").is_none());
        assert!(!registry.abort("req-1", None));
    }

    #[tokio::test]
    async fn test_handle_wakes_waiter_and_records_reason() {
        let handle = AbortHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.aborted().await;
            waiter.reason()
        });

        // Give the waiter a chance to park before signalling.
        tokio::task::yield_now().await;
        handle.abort("client_stop");
        assert_eq!(task.await.unwrap(), Some("client_stop".to_string()));
    }

    #[tokio::test]
    async fn test_aborted_resolves_immediately_after_abort() {
        let handle = AbortHandle::new();
        handle.abort("client_stop");
        handle.aborted().await;
        assert_eq!(handle.reason(), Some("client_stop".to_string()));
    }
}
