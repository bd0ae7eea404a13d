use std::sync::Arc;

use tracing::{debug, info};

use super::JobContext;
use super::StrategyOutcome;
use super::error::DownloadError;
use super::fetcher::{ChunkFetcher, ChunkOutcome};
use super::manifest::{KeyMode, ManifestModel};
use super::progress::{JobProgress, ProgressUnit};
use crate::post_process::subtitles::SubtitleAttacher;

const LOCAL_PLAYLIST: &str = "playlist.m3u8";

/// HLS 下载：解析清单 -> 下载密钥 / 初始化分片 -> 并发下载分片 -> 重写清单 -> 交给封装工具
pub(crate) async fn download(ctx: &JobContext<'_>) -> Result<StrategyOutcome, DownloadError> {
    let url = ctx.spec.link.as_str();
    let text = ctx
        .config
        .retry
        .run("manifest", || ctx.transport.fetch_text(url))
        .await?;
    let model = ManifestModel::parse(&ctx.spec.link, &text)?;

    match model.key_mode() {
        KeyMode::KeyedWithIv { method, iv, .. } => {
            return Err(DownloadError::UnsupportedEncryption {
                method: method.clone(),
                iv: iv.clone(),
            });
        }
        KeyMode::Keyed { method, uri } => debug!("加密流 METHOD={} URI={}", method, uri),
        KeyMode::Clear => debug!("未加密的流"),
    }

    let fetcher = ChunkFetcher::new(
        Arc::clone(&ctx.transport),
        ctx.workspace.path(),
        ctx.config.retry,
    );

    // 密钥与初始化分片只下载一次，失败即整个任务失败
    for resource in model.resource_chunks() {
        if let ChunkOutcome::Failed { reason } = fetcher.fetch(&resource).await {
            return Err(DownloadError::ManifestError(format!(
                "密钥或初始化分片下载失败: {reason}"
            )));
        }
    }

    let segments = model.segment_chunks();
    info!("共 {} 个分片（清单中 {} 行引用）", segments.len(), model.segments().len());
    let progress = Arc::new(JobProgress::new(
        segments.len() as u64,
        ProgressUnit::Segments,
        &ctx.label,
        ctx.multi,
    ));
    let snapshot = ctx
        .core
        .run_all(
            segments,
            move |chunk| {
                let fetcher = fetcher.clone();
                async move { fetcher.fetch(&chunk).await }
            },
            progress,
        )
        .await?;

    let playlist = ctx.workspace.file(LOCAL_PLAYLIST);
    tokio::fs::write(&playlist, model.rewrite()).await?;

    let subtitles = if ctx.spec.subtitles.is_empty() {
        Vec::new()
    } else {
        SubtitleAttacher::new(
            Arc::clone(&ctx.transport),
            ctx.workspace.path(),
            ctx.config.retry,
        )
        .prepare(&ctx.spec.subtitles, &ctx.spec.subtitle_decryption)
        .await
    };

    ctx.remuxer
        .remux_playlist(&playlist, &subtitles, &ctx.spec.output_path())
        .await?;

    Ok(StrategyOutcome {
        snapshot,
        subtitles: subtitles.len(),
    })
}
