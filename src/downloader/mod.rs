use std::sync::Arc;
use std::time::Instant;

use indicatif::MultiProgress;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::core::DownloadCore;
use error::DownloadError;
use models::{DownloadJobSpec, DownloadKind};
use progress::ProgressSnapshot;
use task::{JobReport, JobState, JobStatus};
use workspace::{TempWorkspace, reusable_len};

use crate::common::client::client::MediaClient;
use crate::common::client::transport::Transport;
use crate::common::config::DownloaderConfig;
use crate::common::utils::shortened_episode_name;
use crate::post_process::merger::{FfmpegRemuxer, Remuxer};

pub mod core;
pub mod error;
pub mod fetcher;
pub mod hls;
pub mod manager;
pub mod manifest;
pub mod merger;
pub mod models;
pub mod progress;
pub mod progressive;
pub mod retry;
pub mod task;
pub mod workspace;

/// 两种下载方式共用同一入口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStrategy {
    Progressive,
    Hls,
}

impl From<DownloadKind> for DownloadStrategy {
    fn from(kind: DownloadKind) -> Self {
        match kind {
            DownloadKind::Progressive => DownloadStrategy::Progressive,
            DownloadKind::Hls => DownloadStrategy::Hls,
        }
    }
}

impl DownloadStrategy {
    fn state(&self) -> JobState {
        match self {
            DownloadStrategy::Progressive => JobState::ProgressiveDownload,
            DownloadStrategy::Hls => JobState::HlsDownload,
        }
    }

    pub(crate) async fn start(&self, ctx: &JobContext<'_>) -> Result<StrategyOutcome, DownloadError> {
        match self {
            DownloadStrategy::Progressive => progressive::download(ctx).await,
            DownloadStrategy::Hls => hls::download(ctx).await,
        }
    }
}

/// 下载策略运行期间可用的全部依赖
pub(crate) struct JobContext<'a> {
    pub spec: &'a DownloadJobSpec,
    pub config: &'a DownloaderConfig,
    pub transport: Arc<dyn Transport>,
    pub remuxer: Arc<dyn Remuxer>,
    pub workspace: &'a TempWorkspace,
    pub core: DownloadCore,
    pub multi: Option<&'a MultiProgress>,
    pub label: String,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StrategyOutcome {
    pub snapshot: ProgressSnapshot,
    /// 成功封装进输出文件的字幕数
    pub subtitles: usize,
}

/// 单个文件的完整下载流程
pub struct DownloadJob {
    spec: DownloadJobSpec,
    config: Arc<DownloaderConfig>,
    transport: Option<Arc<dyn Transport>>,
    remuxer: Option<Arc<dyn Remuxer>>,
    multi: Option<MultiProgress>,
    cancel: CancellationToken,
    state: JobState,
}

impl DownloadJob {
    pub fn new(spec: DownloadJobSpec, config: Arc<DownloaderConfig>) -> Self {
        Self {
            spec,
            config,
            transport: None,
            remuxer: None,
            multi: None,
            cancel: CancellationToken::new(),
            state: JobState::Initialized,
        }
    }

    /// 不指定时使用带默认请求头与 Cookie 的 [`MediaClient`]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 不指定时使用系统 ffmpeg
    pub fn with_remuxer(mut self, remuxer: Arc<dyn Remuxer>) -> Self {
        self.remuxer = Some(remuxer);
        self
    }

    pub fn with_progress(mut self, multi: MultiProgress) -> Self {
        self.multi = Some(multi);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn spec(&self) -> &DownloadJobSpec {
        &self.spec
    }

    fn transition(&mut self, next: JobState) {
        debug!("[{}] {:?} -> {:?}", self.spec.output_file_name, self.state, next);
        self.state = next;
    }

    pub async fn run(mut self) -> JobReport {
        let started = Instant::now();
        let name = self.spec.output_file_name.clone();
        let output = self.spec.output_path();

        // 输出文件已存在时不触碰临时目录
        if reusable_len(&output, None).await.is_some() {
            info!("{} already exists, skipping", name);
            return JobReport::new(name, JobStatus::Skipped("exists".to_string()));
        }
        if self.cancel.is_cancelled() {
            return JobReport::new(name, JobStatus::Cancelled);
        }

        let workspace = TempWorkspace::for_output(&self.config.temp_root(), &name);
        let result = self.execute(&workspace).await;

        match result {
            Ok(outcome) => {
                if let Err(e) = workspace.remove().await {
                    warn!("删除临时目录 {:?} 失败: {}", workspace.path(), e);
                }
                workspace.cleanup_empty_dirs(&self.spec.output_dir).await;
                self.transition(JobState::Cleaned);
                self.transition(JobState::Done);

                let elapsed = started.elapsed();
                info!("✅ {} 下载完成", name);
                JobReport::new(name, JobStatus::Completed(elapsed)).with_progress(Some(outcome.snapshot))
            }
            Err(e) => {
                self.transition(JobState::Failed);
                // 非空的临时目录保留，供下次复用
                workspace.cleanup_empty_dirs(&self.spec.output_dir).await;
                if matches!(e, DownloadError::Cancelled) {
                    warn!("{} 已取消", name);
                    JobReport::new(name, JobStatus::Cancelled)
                } else {
                    error!("❌ {} 下载失败: {}", name, e);
                    JobReport::new(name, JobStatus::Failed(e.to_string()))
                }
            }
        }
    }

    async fn execute(&mut self, workspace: &TempWorkspace) -> Result<StrategyOutcome, DownloadError> {
        workspace.create().await?;
        self.transition(JobState::TempWorkspaceReady);
        tokio::fs::create_dir_all(&self.spec.output_dir).await?;

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(MediaClient::with_cookies(
                &self.config,
                self.spec.referer.as_deref(),
                Some(&self.spec.link),
                &self.spec.cookies,
            )?),
        };
        let remuxer: Arc<dyn Remuxer> = match &self.remuxer {
            Some(remuxer) => Arc::clone(remuxer),
            None => Arc::new(FfmpegRemuxer::new(self.config.ffmpeg_command())),
        };

        let strategy = DownloadStrategy::from(self.spec.kind);
        self.transition(strategy.state());

        let ctx = JobContext {
            spec: &self.spec,
            config: &self.config,
            transport,
            remuxer,
            workspace,
            core: DownloadCore::new(self.config.workers_per_file())
                .with_cancellation(self.cancel.clone()),
            multi: self.multi.as_ref(),
            label: shortened_episode_name(&self.spec.output_file_name),
        };
        let outcome = strategy.start(&ctx).await?;

        self.transition(JobState::Assembled);
        if outcome.subtitles > 0 {
            self.transition(JobState::SubtitlesAttached);
        }
        Ok(outcome)
    }
}
