use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use media_downloader::cli::Cli;
use media_downloader::common::config::{Concurrency, DownloaderConfig, TempDirSetting};
use media_downloader::common::logger::PrettyLogger;
use media_downloader::downloader::models::DownloadDescriptor;
use media_downloader::{DownloadManager, log_error, log_info, log_step, log_warning};

/// 配置文件与命令行参数合并，命令行优先
fn load_config(args: &Cli) -> Result<DownloaderConfig> {
    let mut config = match &args.config {
        Some(path) => DownloaderConfig::load(path)?,
        None => DownloaderConfig::default(),
    };

    if let Some(dir) = &args.output_dir {
        config.download_dir = dir.clone();
    }
    if let Some(temp) = &args.temp_dir {
        config.temp_download_dir = if temp.eq_ignore_ascii_case("auto") {
            TempDirSetting::Auto
        } else {
            TempDirSetting::Path(PathBuf::from(temp))
        };
    }
    if let Some(value) = &args.concurrency {
        config.concurrency_per_file = Concurrency::parse(value).map_err(anyhow::Error::msg)?;
    }
    if let Some(parallel) = args.parallel {
        config.max_parallel_downloads = parallel;
    }
    if let Some(timeout) = args.timeout {
        config.request_timeout = timeout;
    }
    config.validate()?;

    if config.use_alternate_http_client {
        log_warning!("use_alternate_http_client 已忽略，统一使用 reqwest 客户端");
    }
    Ok(config)
}

async fn read_jobs(path: &Path) -> Result<Vec<DownloadDescriptor>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取任务文件失败: {}", path.display()))?;
    let jobs = serde_json::from_str(&text)
        .with_context(|| format!("任务文件格式错误: {}", path.display()))?;
    Ok(jobs)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = load_config(&args).inspect_err(|e| log_error!("配置错误: {}", e))?;
    let descriptors = read_jobs(&args.jobs)
        .await
        .inspect_err(|e| log_error!("{:#}", e))?;

    // 保存目录无法创建时整个批次不启动
    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("无法创建保存目录: {}", config.download_dir.display()))?;

    PrettyLogger::file_info("保存目录", config.download_dir.display().to_string());
    PrettyLogger::file_info("临时目录", config.temp_root().display().to_string());
    debug!("配置: {:?}", config);

    let manager = DownloadManager::new(Arc::new(config));
    let cancel = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在停止下载...");
            cancel.cancel();
        }
    });

    log_step!("开始下载 {} 个任务", descriptors.len());
    let reports = manager.run_descriptors(descriptors).await;
    info!("全部任务结束");

    PrettyLogger::download_summary(&reports);
    if reports.iter().any(|r| !r.status.is_success()) {
        log_info!("失败的任务可直接重新运行，已下载的分块会被复用");
    }
    Ok(())
}
