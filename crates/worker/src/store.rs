//! 任务快照的持久化
//!
//! 每个任务保存为存储目录下的 `<taskId>.json`。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use orchestrator_domain::TaskRecord;
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, record: &TaskRecord) -> OrchestratorResult<()>;

    async fn load(&self, id: &str) -> OrchestratorResult<Option<TaskRecord>>;

    /// 存储中所有任务 ID
    async fn list_ids(&self) -> OrchestratorResult<Vec<String>>;

    async fn remove(&self, id: &str) -> OrchestratorResult<()>;
}

pub struct JsonFileTaskStore {
    dir: PathBuf,
}

impl JsonFileTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn validate_id(id: &str) -> OrchestratorResult<()> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(OrchestratorError::persistence(format!(
                "非法的任务ID: {id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn save(&self, record: &TaskRecord) -> OrchestratorResult<()> {
        Self::validate_id(&record.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let bytes = record.encode()?;
        let path = self.path_for(&record.id);
        // 先写临时文件再重命名，避免读到写了一半的快照；
        // 临时文件名各不相同，并发写入不会互相覆盖
        let tmp = self
            .dir
            .join(format!("{}.{}.json.tmp", record.id, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("任务快照已保存: {}", path.display());
        Ok(())
    }

    async fn load(&self, id: &str) -> OrchestratorResult<Option<TaskRecord>> {
        Self::validate_id(id)?;
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => TaskRecord::decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ids(&self) -> OrchestratorResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, id: &str) -> OrchestratorResult<()> {
        Self::validate_id(id)?;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
