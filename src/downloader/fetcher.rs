use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::error::DownloadError;
use super::models::ChunkDescriptor;
use super::retry::RetryPolicy;
use super::workspace::reusable_len;
use crate::common::client::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Downloaded { bytes: u64 },
    Reused { bytes: u64 },
    Failed { reason: String },
}

/// 下载单个分块 / 分片到任务的临时目录。
/// 已存在的有效文件直接复用；重试耗尽后返回 `Failed` 而不是错误，让同批其它分块继续。
#[derive(Clone)]
pub struct ChunkFetcher {
    transport: Arc<dyn Transport>,
    workspace_dir: PathBuf,
    retry: RetryPolicy,
}

impl ChunkFetcher {
    pub fn new(transport: Arc<dyn Transport>, workspace_dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            workspace_dir: workspace_dir.into(),
            retry,
        }
    }

    pub async fn fetch(&self, chunk: &ChunkDescriptor) -> ChunkOutcome {
        let target = self.workspace_dir.join(&chunk.local_name);

        if let Some(bytes) = reusable_len(&target, chunk.expected_len).await {
            debug!("Chunk [{}] already exists. Reusing.", chunk.local_name);
            return ChunkOutcome::Reused { bytes };
        }

        let result = self
            .retry
            .run(&chunk.local_name, || self.download_once(chunk, &target))
            .await;

        match result {
            Ok(bytes) => {
                debug!("Chunk [{}] downloaded", chunk.local_name);
                ChunkOutcome::Downloaded { bytes }
            }
            Err(e) => ChunkOutcome::Failed {
                reason: format!("[{}] {}", chunk.local_name, e),
            },
        }
    }

    async fn download_once(&self, chunk: &ChunkDescriptor, target: &Path) -> Result<u64, DownloadError> {
        let data = self.transport.fetch(&chunk.url, chunk.range).await?;

        if let Some(expected) = chunk.expected_len {
            if data.len() as u64 != expected {
                return Err(DownloadError::LengthMismatch {
                    expected,
                    actual: data.len() as u64,
                });
            }
        }

        // 先写临时文件再改名，中断时不会留下被误认为完整的文件
        let part = target.with_file_name(format!("{}.part", chunk.local_name));
        tokio::fs::write(&part, &data).await?;
        tokio::fs::rename(&part, target).await?;
        Ok(data.len() as u64)
    }
}
