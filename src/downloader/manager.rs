use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use indicatif::MultiProgress;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::DownloadJob;
use super::error::DownloadError;
use super::models::{DownloadDescriptor, DownloadJobSpec};
use super::task::{JobReport, JobStatus};
use super::workspace::TempWorkspace;
use crate::common::client::transport::Transport;
use crate::common::config::DownloaderConfig;
use crate::post_process::merger::Remuxer;

/// 为每个任务创建网络层；不设置时任务使用自己的 `MediaClient`
pub type TransportFactory =
    Arc<dyn Fn(&DownloadJobSpec) -> Result<Arc<dyn Transport>, DownloadError> + Send + Sync>;

/// 批量下载：外层并发由 `max_parallel_downloads` 控制，与任务内部的分块并发互相独立
#[derive(Clone)]
pub struct DownloadManager {
    config: Arc<DownloaderConfig>,
    semaphore: Arc<Semaphore>,
    // 临时目录 -> 占用它的输出文件名
    active: Arc<DashMap<PathBuf, String>>,
    transport_factory: Option<TransportFactory>,
    remuxer: Option<Arc<dyn Remuxer>>,
    multi: MultiProgress,
    cancel: CancellationToken,
}

impl DownloadManager {
    pub fn new(config: Arc<DownloaderConfig>) -> Self {
        let permits = config.max_parallel_downloads.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            active: Arc::new(DashMap::new()),
            transport_factory: None,
            remuxer: None,
            multi: MultiProgress::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn with_remuxer(mut self, remuxer: Arc<dyn Remuxer>) -> Self {
        self.remuxer = Some(remuxer);
        self
    }

    pub fn with_progress(mut self, multi: MultiProgress) -> Self {
        self.multi = multi;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 上游给出的原始描述：无法构造任务的直接记为跳过
    pub async fn run_descriptors(&self, descriptors: Vec<DownloadDescriptor>) -> Vec<JobReport> {
        let entries = descriptors
            .into_iter()
            .map(|desc| {
                DownloadJobSpec::from_descriptor(&desc, &self.config.download_dir).map_err(|e| {
                    let name = if desc.output_file_name.trim().is_empty() {
                        desc.link.clone().unwrap_or_else(|| "<unnamed>".to_string())
                    } else {
                        desc.output_file_name.clone()
                    };
                    let reason = match e {
                        DownloadError::InvalidDescriptor(reason) => reason,
                        other => other.to_string(),
                    };
                    JobReport::new(name, JobStatus::Skipped(reason))
                })
            })
            .collect();
        self.run_entries(entries).await
    }

    pub async fn run_batch(&self, specs: Vec<DownloadJobSpec>) -> Vec<JobReport> {
        self.run_entries(specs.into_iter().map(Ok).collect()).await
    }

    /// 结果按提交顺序返回，与完成顺序无关
    async fn run_entries(&self, entries: Vec<Result<DownloadJobSpec, JobReport>>) -> Vec<JobReport> {
        let total = entries.len();
        let mut reports: Vec<Option<JobReport>> = vec![None; total];
        let mut names = vec![String::new(); total];
        let mut registered = Vec::new();
        let mut running = JoinSet::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let spec = match entry {
                Ok(spec) => spec,
                Err(report) => {
                    self.announce(&report);
                    reports[index] = Some(report);
                    continue;
                }
            };
            names[index] = spec.output_file_name.clone();

            let key = TempWorkspace::for_output(&self.config.temp_root(), &spec.output_file_name)
                .path()
                .to_path_buf();
            if let Some(owner) = self.active.get(&key) {
                warn!("{} 与 {} 使用同一个临时目录，跳过", spec.output_file_name, owner.value());
                let report = JobReport::new(
                    spec.output_file_name.clone(),
                    JobStatus::Skipped(format!("duplicate of {}", owner.value())),
                );
                self.announce(&report);
                reports[index] = Some(report);
                continue;
            }
            self.active.insert(key.clone(), spec.output_file_name.clone());
            registered.push(key);

            let job = match self.build_job(spec) {
                Ok(job) => job,
                Err(report) => {
                    self.announce(&report);
                    reports[index] = Some(report);
                    continue;
                }
            };

            let semaphore = Arc::clone(&self.semaphore);
            let cancel = self.cancel.clone();
            let multi = self.multi.clone();
            running.spawn(async move {
                let name = job.spec().output_file_name.clone();
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let report = match permit {
                    Some(_permit) if !cancel.is_cancelled() => job.run().await,
                    _ => JobReport::new(name, JobStatus::Cancelled),
                };
                let _ = multi.println(report.to_string());
                (index, report)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(e) => warn!("下载任务异常退出: {}", e),
            }
        }

        for key in registered {
            self.active.remove(&key);
        }

        reports
            .into_iter()
            .zip(names)
            .map(|(report, name)| {
                report.unwrap_or_else(|| JobReport::new(name, JobStatus::Failed("任务异常退出".to_string())))
            })
            .collect()
    }

    fn build_job(&self, spec: DownloadJobSpec) -> Result<DownloadJob, JobReport> {
        let mut job = DownloadJob::new(spec, Arc::clone(&self.config))
            .with_progress(self.multi.clone())
            .with_cancellation(self.cancel.clone());

        if let Some(factory) = &self.transport_factory {
            match factory(job.spec()) {
                Ok(transport) => job = job.with_transport(transport),
                Err(e) => {
                    let name = job.spec().output_file_name.clone();
                    return Err(JobReport::new(name, JobStatus::Failed(e.to_string())));
                }
            }
        }
        if let Some(remuxer) = &self.remuxer {
            job = job.with_remuxer(Arc::clone(remuxer));
        }
        debug!("已提交任务: {}", job.spec().output_file_name);
        Ok(job)
    }

    fn announce(&self, report: &JobReport) {
        let _ = self.multi.println(report.to_string());
    }
}
