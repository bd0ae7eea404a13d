use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::DownloadError;
use super::fetcher::ChunkOutcome;
use super::models::ChunkDescriptor;
use super::progress::{JobProgress, ProgressSnapshot};

/// 单个任务内部的并发下载池
#[derive(Clone)]
pub struct DownloadCore {
    workers: usize,
    cancel: CancellationToken,
}

impl DownloadCore {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 并发执行全部下载，按完成顺序汇总。分块之间没有顺序要求，顺序只在合并时按序号保证。
    /// 任一分块失败则整体失败，已下载的文件留在临时目录供下次复用。
    pub async fn run_all<F, Fut>(
        &self,
        chunks: Vec<ChunkDescriptor>,
        fetch: F,
        progress: Arc<JobProgress>,
    ) -> Result<ProgressSnapshot, DownloadError>
    where
        F: Fn(ChunkDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChunkOutcome> + Send + 'static,
    {
        let total = chunks.len();
        let unit = progress.unit().label();
        debug!("开始下载 {} 个{}，并发数 {}", total, unit, self.workers);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let fetch = Arc::new(fetch);
        let mut running = JoinSet::new();

        for chunk in chunks {
            let semaphore = Arc::clone(&semaphore);
            let fetch = Arc::clone(&fetch);
            let cancel = self.cancel.clone();
            running.spawn(async move {
                let name = chunk.local_name.clone();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return ChunkOutcome::Failed {
                            reason: format!("[{name}] 信号量错误"),
                        };
                    }
                };
                if cancel.is_cancelled() {
                    return ChunkOutcome::Failed {
                        reason: format!("[{name}] 已取消"),
                    };
                }
                tokio::select! {
                    outcome = fetch(chunk) => outcome,
                    _ = cancel.cancelled() => ChunkOutcome::Failed {
                        reason: format!("[{name}] 已取消"),
                    },
                }
            });
        }

        while let Some(joined) = running.join_next().await {
            let outcome = joined.unwrap_or_else(|e| ChunkOutcome::Failed {
                reason: format!("工作任务异常退出: {e}"),
            });
            if let ChunkOutcome::Failed { reason } = &outcome {
                warn!("{}下载失败: {}", unit, reason);
            }
            progress.record(&outcome);
        }
        progress.finish();

        let snapshot = progress.snapshot();
        info!(
            "{}下载状态: Total: {} | Reused: {} | Failed: {}",
            unit, total, snapshot.reused_count, snapshot.failed_count
        );

        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if snapshot.failed_count > 0 {
            return Err(DownloadError::PartialFailure {
                failed: snapshot.failed_count,
                total,
                unit,
            });
        }
        Ok(snapshot)
    }
}
