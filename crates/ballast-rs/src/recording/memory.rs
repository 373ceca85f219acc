//! In-process [`ConversationStore`].

use super::{ConversationRecord, ConversationStore, StoreError, StoreFuture, TenantScope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps records in a map keyed by id. Counts writes and tenant scopes so
/// tests can assert on them, and can be told to fail saves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, ConversationRecord>>,
    inserts: AtomicUsize,
    updates: AtomicUsize,
    failing_saves: AtomicUsize,
    scopes_acquired: AtomicUsize,
    scopes_released: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `save` fail.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<ConversationRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<ConversationRecord> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.turn.cmp(&b.turn)));
        records
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn scopes_acquired(&self) -> usize {
        self.scopes_acquired.load(Ordering::SeqCst)
    }

    pub fn scopes_released(&self) -> usize {
        self.scopes_released.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ConversationStore for MemoryStore {
    fn save<'a>(
        &'a self,
        _scope: &'a TenantScope,
        record: &'a ConversationRecord,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.take_failure() {
                return Err(StoreError::Other("injected save failure".to_string()));
            }
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(record.id.clone(), record.clone());
            self.inserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn update<'a>(
        &'a self,
        _scope: &'a TenantScope,
        record: &'a ConversationRecord,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let Some(slot) = records.get_mut(&record.id) else {
                return Err(StoreError::NotFound(record.id.clone()));
            };
            *slot = record.clone();
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn tenant_scope<'a>(&'a self, project_id: &'a str) -> StoreFuture<'a, TenantScope> {
        Box::pin(async move {
            self.scopes_acquired.fetch_add(1, Ordering::SeqCst);
            let released = self.scopes_released.clone();
            Ok(TenantScope::new(project_id, move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        })
    }
}
