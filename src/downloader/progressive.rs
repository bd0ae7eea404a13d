use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::JobContext;
use super::error::DownloadError;
use super::fetcher::ChunkFetcher;
use super::merger::ChunkAssembler;
use super::models::plan_chunks;
use super::progress::{JobProgress, ProgressUnit};
use super::workspace::reusable_len;
use super::StrategyOutcome;
use crate::post_process::subtitles::SubtitleAttacher;

/// 直链下载：探测大小 -> 按 Range 分块并发下载 -> 按序号拼接 -> 可选的字幕封装
pub(crate) async fn download(ctx: &JobContext<'_>) -> Result<StrategyOutcome, DownloadError> {
    let url = ctx.spec.link.as_str();
    let total = ctx
        .config
        .retry
        .run("content-length", || ctx.transport.content_length(url))
        .await?;
    info!("文件大小: {} 字节", total);

    let chunks = plan_chunks(url, total, ctx.config.chunk_size, &ctx.spec.output_file_name);
    let progress = Arc::new(JobProgress::new(
        total,
        ProgressUnit::Bytes,
        &ctx.label,
        ctx.multi,
    ));

    let fetcher = ChunkFetcher::new(
        Arc::clone(&ctx.transport),
        ctx.workspace.path(),
        ctx.config.retry,
    );
    let snapshot = ctx
        .core
        .run_all(
            chunks.clone(),
            move |chunk| {
                let fetcher = fetcher.clone();
                async move { fetcher.fetch(&chunk).await }
            },
            progress,
        )
        .await?;

    let output = ctx.spec.output_path();
    ChunkAssembler::concat(ctx.workspace.path(), &chunks, &output).await?;

    let subtitles = if ctx.spec.subtitles.is_empty() {
        0
    } else {
        attach_subtitles(ctx, &output).await
    };

    Ok(StrategyOutcome {
        snapshot,
        subtitles,
    })
}

/// 对已合并的视频做第二遍封装。成功生成非空的新文件后才替换原文件，
/// 失败时保留不带字幕的视频。
async fn attach_subtitles(ctx: &JobContext<'_>, output: &Path) -> usize {
    let attacher = SubtitleAttacher::new(
        Arc::clone(&ctx.transport),
        ctx.workspace.path(),
        ctx.config.retry,
    );
    let inputs = attacher
        .prepare(&ctx.spec.subtitles, &ctx.spec.subtitle_decryption)
        .await;
    if inputs.is_empty() {
        return 0;
    }

    let muxed = muxed_path(output);
    let result = ctx.remuxer.mux_subtitles(output, &inputs, &muxed).await;
    let replaced = match result {
        Ok(()) if reusable_len(&muxed, None).await.is_some() => {
            tokio::fs::rename(&muxed, output).await.map_err(DownloadError::from)
        }
        Ok(()) => Err(DownloadError::FfmpegError("字幕封装未生成输出文件".to_string())),
        Err(e) => Err(e),
    };

    match replaced {
        Ok(()) => {
            info!("已封装 {} 条字幕", inputs.len());
            inputs.len()
        }
        Err(e) => {
            warn!("字幕封装失败，保留无字幕视频: {}", e);
            let _ = tokio::fs::remove_file(&muxed).await;
            0
        }
    }
}

/// 与输出文件同目录，保证改名不跨文件系统
fn muxed_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{}.subs.{}", stem, ext.to_string_lossy()),
        None => format!("{stem}.subs"),
    };
    output.with_file_name(name)
}
