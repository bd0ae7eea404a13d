use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::downloader::error::DownloadError;
use crate::downloader::workspace::partial_path;

const STDERR_TAIL_LINES: usize = 8;

/// 参与封装的外挂字幕
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleInput {
    pub label: String,
    pub path: PathBuf,
}

/// 外部封装工具的边界：只做无损的容器转换，不重新编码
#[async_trait]
pub trait Remuxer: Send + Sync {
    /// 读取本地化后的 m3u8，连同字幕一次性封装到 `output`
    async fn remux_playlist(
        &self,
        playlist: &Path,
        subtitles: &[SubtitleInput],
        output: &Path,
    ) -> Result<(), DownloadError>;

    /// 把字幕封装进已合并好的视频文件，结果写到 `output`
    async fn mux_subtitles(
        &self,
        video: &Path,
        subtitles: &[SubtitleInput],
        output: &Path,
    ) -> Result<(), DownloadError>;
}

pub struct FfmpegRemuxer {
    ffmpeg_cmd: String,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_cmd: impl Into<String>) -> Self {
        Self {
            ffmpeg_cmd: ffmpeg_cmd.into(),
        }
    }

    async fn ensure_available(&self) -> Result<(), DownloadError> {
        debug!("检查系统中是否安装了 ffmpeg...");
        let status = Command::new(&self.ffmpeg_cmd)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => {
                error!("❌ 未检测到 ffmpeg，请确保系统中已安装并配置了 ffmpeg 可执行路径。");
                error!("或者设置环境变量 FFMPEG_PATH 指向 ffmpeg 可执行文件路径");
                Err(DownloadError::FfmpegNotFound(self.ffmpeg_cmd.clone()))
            }
        }
    }

    /// 输出先写到 `.part` 文件，ffmpeg 成功退出且文件非空后才改名
    async fn run(&self, args: Vec<OsString>, output: &Path) -> Result<(), DownloadError> {
        self.ensure_available().await?;

        let partial = partial_path(output);
        let mut args = args;
        args.push("-y".into());
        args.push(partial.clone().into_os_string());
        debug!("执行 ffmpeg: {} {:?}", self.ffmpeg_cmd, args);

        let result = Command::new(&self.ffmpeg_cmd)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !result.status.success() {
            let err_msg = String::from_utf8_lossy(&result.stderr).trim().to_string();
            error!("❌ ffmpeg 执行失败，错误日志如下：\n{}", err_msg);
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(DownloadError::FfmpegError(stderr_tail(&err_msg)));
        }

        let produced = tokio::fs::metadata(&partial)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !produced {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(DownloadError::FfmpegError(format!("未生成输出文件: {:?}", output)));
        }

        tokio::fs::rename(&partial, output).await?;
        info!("✅ ffmpeg 封装成功，输出文件: {:?}", output);
        Ok(())
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux_playlist(
        &self,
        playlist: &Path,
        subtitles: &[SubtitleInput],
        output: &Path,
    ) -> Result<(), DownloadError> {
        self.run(playlist_args(playlist, subtitles), output).await
    }

    async fn mux_subtitles(
        &self,
        video: &Path,
        subtitles: &[SubtitleInput],
        output: &Path,
    ) -> Result<(), DownloadError> {
        self.run(subtitle_args(video, subtitles), output).await
    }
}

/// 错误信息只保留 stderr 的最后几行
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return "未知错误".to_string();
    }
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n")
}

/// HLS：本地清单里的分片和密钥都是本地文件，需要放开扩展名与协议限制
pub fn playlist_args(playlist: &Path, subtitles: &[SubtitleInput]) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-loglevel",
        "error",
        "-protocol_whitelist",
        "file,crypto,data",
        "-extension_picky",
        "0",
        "-allowed_extensions",
        "ALL",
        "-i",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(playlist.as_os_str().to_owned());
    push_subtitle_streams(&mut args, subtitles);
    args.extend(["-bsf:a", "aac_adtstoasc"].map(OsString::from));
    args
}

/// 直链：对已合并的视频做第二遍封装，只追加字幕流
pub fn subtitle_args(video: &Path, subtitles: &[SubtitleInput]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-loglevel".into(), "error".into(), "-i".into()];
    args.push(video.as_os_str().to_owned());
    push_subtitle_streams(&mut args, subtitles);
    args
}

fn push_subtitle_streams(args: &mut Vec<OsString>, subtitles: &[SubtitleInput]) {
    for sub in subtitles {
        args.push("-i".into());
        args.push(sub.path.as_os_str().to_owned());
    }
    // 纯音频或纯视频的流都可能出现
    args.extend(["-map", "0:v?", "-map", "0:a?"].map(OsString::from));
    for index in 1..=subtitles.len() {
        args.push("-map".into());
        args.push(index.to_string().into());
    }
    for (index, sub) in subtitles.iter().enumerate() {
        args.push(format!("-metadata:s:s:{index}").into());
        args.push(format!("title={}", sub.label).into());
    }
    args.extend(["-c:v", "copy", "-c:a", "copy"].map(OsString::from));
    if !subtitles.is_empty() {
        args.extend(["-c:s", "mov_text"].map(OsString::from));
    }
}
