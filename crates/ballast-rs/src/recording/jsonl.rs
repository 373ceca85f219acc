//! Append-only JSON Lines store.
//!
//! Every insert and update is appended as one line:
//!
//! ```text
//! {"op":"insert","record":{...,"status":"pending",...}}
//! {"op":"update","record":{...,"status":"success",...}}
//! ```
//!
//! [`JsonlStore::read_all`] folds the log back into the latest state of each
//! record.

use super::{ConversationRecord, ConversationStore, StoreError, StoreFuture, TenantScope};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Op {
    Insert,
    Update,
}

#[derive(Serialize)]
struct LogLineRef<'a> {
    op: Op,
    record: &'a ConversationRecord,
}

#[derive(Deserialize)]
struct LogLine {
    op: Op,
    record: ConversationRecord,
}

#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlStore {
    /// Open `path` for appending, creating it (and its parent directory) if
    /// needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, op: Op, record: &ConversationRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(&LogLineRef { op, record })?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Latest state of every record in the log, in first-insert order.
    /// Updates for ids never inserted are applied as inserts. Unparseable
    /// lines are skipped.
    pub fn read_all(path: &Path) -> Result<Vec<ConversationRecord>, StoreError> {
        let content = std::fs::read_to_string(path)?;
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, ConversationRecord> = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogLine = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}:{}: skipping bad line: {e}", path.display(), lineno + 1);
                    continue;
                }
            };
            let id = entry.record.id.clone();
            if entry.op == Op::Update && !latest.contains_key(&id) {
                debug!("Update for unknown record {id}; treating as insert");
            }
            if latest.insert(id.clone(), entry.record).is_none() {
                order.push(id);
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }
}

impl ConversationStore for JsonlStore {
    fn save<'a>(
        &'a self,
        _scope: &'a TenantScope,
        record: &'a ConversationRecord,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.append(Op::Insert, record))
    }

    fn update<'a>(
        &'a self,
        _scope: &'a TenantScope,
        record: &'a ConversationRecord,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.append(Op::Update, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use crate::recording::{Completion, RecordStatus};
    use std::time::Duration;

    #[tokio::test]
    async fn folds_insert_and_update_into_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/records.jsonl");
        let store = JsonlStore::open(&path).await.unwrap();
        let scope = TenantScope::unscoped("p");

        let mut first = ConversationRecord::pending("p", "m", "e", 1, vec![Message::user("a")], None);
        let second = ConversationRecord::pending("p", "m", "e", 2, vec![Message::user("b")], None);
        store.save(&scope, &first).await.unwrap();
        store.save(&scope, &second).await.unwrap();
        first.apply(&Completion::Success {
            content: "done".into(),
            usage: None,
            duration: Duration::from_millis(5),
        });
        store.update(&scope, &first).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.lines().last().unwrap().starts_with(r#"{"op":"update""#));

        let records = JsonlStore::read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, first.id);
        assert_eq!(records[0].status, RecordStatus::Success);
        assert_eq!(records[0].response_content, "done");
        assert_eq!(records[1].status, RecordStatus::Pending);
    }

    #[test]
    fn bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.jsonl");
        std::fs::write(&path, "not json\n\n").unwrap();
        assert!(JsonlStore::read_all(&path).unwrap().is_empty());
    }
}
