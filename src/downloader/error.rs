use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP错误: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("HTTP 请求失败，状态码: {status}，URL: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("无效的任务描述: {0}")]
    InvalidDescriptor(String),

    #[error("无法获取文件大小: {0}")]
    UnknownSize(String),

    #[error("数据长度不符，期望 {expected} 字节，实际 {actual} 字节")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("清单解析失败: {0}")]
    ManifestError(String),

    #[error("暂不支持带 IV 的加密 HLS 流 (METHOD={method}, IV={iv})")]
    UnsupportedEncryption { method: String, iv: String },

    #[error("{failed} / {total} 个{unit}下载失败")]
    PartialFailure {
        failed: usize,
        total: usize,
        unit: &'static str,
    },

    #[error("文件不存在: {0:?}")]
    FileNotFound(PathBuf),

    #[error("合并错误: {0}")]
    MergeError(String),

    #[error("未检测到 ffmpeg ({0})，请安装 ffmpeg 或设置环境变量 FFMPEG_PATH")]
    FfmpegNotFound(String),

    #[error("ffmpeg 执行失败: {0}")]
    FfmpegError(String),

    #[error("字幕处理失败: {0}")]
    SubtitleError(String),

    #[error("任务已取消")]
    Cancelled,
}

impl DownloadError {
    /// 是否值得重试：超时、连接错误、5xx、429 以及传输被截断
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::HttpError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            DownloadError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            DownloadError::LengthMismatch { .. } => true,
            _ => false,
        }
    }
}
