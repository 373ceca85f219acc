//! Audit recording of model exchanges.
//!
//! Each exchange is written in two phases: a [`ConversationRecord`] is saved
//! as `Pending` before the call, then completed as `Success` or `Error`
//! after it. Completion is queued to a background worker
//! ([`ConversationRecorder`]) so the caller never blocks on storage.
//!
//! - [`recorder`] — [`ConversationRecorder`], the bounded queue and worker.
//! - [`jsonl`] — [`JsonlStore`], an append-only JSON Lines file store.
//! - [`memory`] — [`MemoryStore`], an in-process store for tests and tools.

pub mod jsonl;
pub mod memory;
pub mod recorder;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use recorder::{ConversationRecorder, PendingRecord, RecorderConfig, RecorderStats};

use crate::api::classify::ProviderError;
use crate::{Message, UsageInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

// ── Record ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Success,
    Error,
}

/// One model exchange as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub project_id: String,
    pub model: String,
    pub endpoint: String,
    /// 1-based turn index within the conversation.
    pub turn: u32,
    pub request_messages: Vec<Message>,
    #[serde(default)]
    pub response_content: String,
    pub temperature: Option<f32>,
    pub status: RecordStatus,
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversationRecord {
    /// A fresh `Pending` record with a new id.
    pub fn pending(
        project_id: impl Into<String>,
        model: impl Into<String>,
        endpoint: impl Into<String>,
        turn: u32,
        request_messages: Vec<Message>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            model: model.into(),
            endpoint: endpoint.into(),
            turn,
            request_messages,
            response_content: String::new(),
            temperature,
            status: RecordStatus::Pending,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            duration_ms: 0,
            error_message: None,
            context: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context.extend(context);
        self
    }

    /// Move the record to its final status.
    pub fn apply(&mut self, completion: &Completion) {
        match completion {
            Completion::Success {
                content,
                usage,
                duration,
            } => {
                self.status = RecordStatus::Success;
                self.response_content = content.clone();
                if let Some(usage) = usage {
                    self.prompt_tokens = usage.prompt_tokens.unwrap_or(0);
                    self.completion_tokens = usage.completion_tokens.unwrap_or(0);
                    self.total_tokens = usage
                        .total_tokens
                        .unwrap_or(self.prompt_tokens.saturating_add(self.completion_tokens));
                }
                self.duration_ms = duration.as_millis() as u64;
            }
            Completion::Failure { error, duration } => {
                self.status = RecordStatus::Error;
                self.error_message = Some(error.clone());
                self.duration_ms = duration.as_millis() as u64;
            }
        }
        self.completed_at = Some(Utc::now());
    }
}

/// How an exchange ended.
#[derive(Debug, Clone)]
pub enum Completion {
    Success {
        content: String,
        usage: Option<UsageInfo>,
        duration: Duration,
    },
    Failure {
        error: String,
        duration: Duration,
    },
}

impl Completion {
    pub fn failure(error: &ProviderError, duration: Duration) -> Self {
        Completion::Failure {
            error: error.to_string(),
            duration,
        }
    }
}

// ── Store seam ─────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("tenant scope unavailable for project '{0}'")]
    Tenant(String),
    #[error("{0}")]
    Other(String),
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Persistence for conversation records.
///
/// Every write happens inside a [`TenantScope`] obtained from
/// [`tenant_scope`](Self::tenant_scope) and released (dropped) right after.
pub trait ConversationStore: Send + Sync {
    /// Insert a new record.
    fn save<'a>(
        &'a self,
        scope: &'a TenantScope,
        record: &'a ConversationRecord,
    ) -> StoreFuture<'a, ()>;

    /// Replace a previously inserted record (matched by id).
    fn update<'a>(
        &'a self,
        scope: &'a TenantScope,
        record: &'a ConversationRecord,
    ) -> StoreFuture<'a, ()>;

    /// Acquire whatever per-tenant resource writes need (a connection with
    /// row-level security set, a lock, ...). Defaults to an unscoped handle.
    fn tenant_scope<'a>(&'a self, project_id: &'a str) -> StoreFuture<'a, TenantScope> {
        Box::pin(async move { Ok(TenantScope::unscoped(project_id)) })
    }
}

impl<S: ConversationStore + ?Sized> ConversationStore for std::sync::Arc<S> {
    fn save<'a>(
        &'a self,
        scope: &'a TenantScope,
        record: &'a ConversationRecord,
    ) -> StoreFuture<'a, ()> {
        (**self).save(scope, record)
    }

    fn update<'a>(
        &'a self,
        scope: &'a TenantScope,
        record: &'a ConversationRecord,
    ) -> StoreFuture<'a, ()> {
        (**self).update(scope, record)
    }

    fn tenant_scope<'a>(&'a self, project_id: &'a str) -> StoreFuture<'a, TenantScope> {
        (**self).tenant_scope(project_id)
    }
}

/// Handle to a tenant-scoped resource. Dropping it runs the release hook.
pub struct TenantScope {
    project_id: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl TenantScope {
    pub fn new(project_id: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            project_id: project_id.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn unscoped(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            release: None,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Drop for TenantScope {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantScope")
            .field("project_id", &self.project_id)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}
