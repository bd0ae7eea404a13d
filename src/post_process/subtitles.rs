//! 外挂字幕：下载、解压与转码、可选的逐行解密。
//!
//! 字幕处理中的任何错误都只影响对应的那一条字幕，不会让整个任务失败。

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use chardetng::EncodingDetector;
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};
use url::Url;

use super::cipher::SubtitleDecryptor;
use super::merger::SubtitleInput;
use crate::common::client::transport::Transport;
use crate::common::utils::sanitize_file_name;
use crate::downloader::error::DownloadError;
use crate::downloader::models::{SubtitleCipherSpec, SubtitleTrack};
use crate::downloader::retry::RetryPolicy;
use crate::downloader::workspace::reusable_len;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecryptReport {
    /// 需要解密的文本行数
    pub total: usize,
    pub failed: usize,
}

pub struct SubtitleAttacher {
    transport: Arc<dyn Transport>,
    workspace_dir: PathBuf,
    retry: RetryPolicy,
}

impl SubtitleAttacher {
    pub fn new(transport: Arc<dyn Transport>, workspace_dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            workspace_dir: workspace_dir.into(),
            retry,
        }
    }

    /// 准备好所有可用的字幕文件。下载失败的字幕被丢弃，解密失败的行原样保留。
    pub async fn prepare(
        &self,
        tracks: &[SubtitleTrack],
        ciphers: &BTreeMap<String, SubtitleCipherSpec>,
    ) -> Vec<SubtitleInput> {
        let mut inputs = Vec::with_capacity(tracks.len());
        for track in tracks {
            match self.prepare_one(track, ciphers.get(&track.label)).await {
                Ok(path) => inputs.push(SubtitleInput {
                    label: track.label.clone(),
                    path,
                }),
                Err(e) => warn!("字幕 [{}] 处理失败，已跳过: {}", track.label, e),
            }
        }
        inputs
    }

    async fn prepare_one(
        &self,
        track: &SubtitleTrack,
        cipher: Option<&SubtitleCipherSpec>,
    ) -> Result<PathBuf, DownloadError> {
        let file_name = subtitle_file_name(&track.label, &track.url);
        let path = self.workspace_dir.join(&file_name);

        if reusable_len(&path, None).await.is_some() {
            debug!("字幕 [{}] 已存在，跳过下载", file_name);
        } else {
            let bytes = self
                .retry
                .run(&file_name, || self.transport.fetch(&track.url, None))
                .await?;
            let text = decode_payload(&bytes)?;
            let part = self.workspace_dir.join(format!("{file_name}.part"));
            tokio::fs::write(&part, text.as_bytes()).await?;
            tokio::fs::rename(&part, &path).await?;
            info!("字幕 [{}] 下载完成", track.label);
        }

        let Some(spec) = cipher else {
            return Ok(path);
        };

        let decryptor = SubtitleDecryptor::new(spec)?;
        let content = tokio::fs::read_to_string(&path).await?;
        let (plain, report) = decrypt_lines(&content, |line| decryptor.decrypt_line(line));
        if report.failed > 0 {
            warn!(
                "字幕 [{}] 有 {}/{} 行解密失败，已保留原文",
                track.label, report.failed, report.total
            );
        }

        let decrypted = self.workspace_dir.join(format!("decrypted_{file_name}"));
        tokio::fs::write(&decrypted, plain).await?;
        Ok(decrypted)
    }
}

/// `<语言>_<URL 文件名>`
pub fn subtitle_file_name(label: &str, url: &str) -> String {
    let base = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(|s| s.to_string()))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "subtitle.srt".to_string());
    sanitize_file_name(&format!("{label}_{base}"))
}

/// 序号行、时间轴行与空行不需要解密
pub fn is_passthrough_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.contains("-->")
        || trimmed.chars().all(|c| c.is_ascii_digit())
}

/// 逐行解密，失败的行原样写回并计数
pub fn decrypt_lines<F>(content: &str, mut decrypt: F) -> (String, DecryptReport)
where
    F: FnMut(&str) -> Result<String, DownloadError>,
{
    let mut report = DecryptReport::default();
    let mut out = String::with_capacity(content.len());

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if is_passthrough_line(line) {
            out.push_str(line);
        } else {
            report.total += 1;
            match decrypt(line) {
                Ok(plain) => out.push_str(&plain),
                Err(e) => {
                    debug!("解密失败: {}", e);
                    report.failed += 1;
                    out.push_str(line);
                }
            }
        }
        out.push('\n');
    }
    (out, report)
}

/// gzip 压缩的字幕先解压，再按探测到的编码转为 UTF-8
pub fn decode_payload(bytes: &[u8]) -> Result<String, DownloadError> {
    let raw = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(bytes);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| DownloadError::SubtitleError(format!("gzip 解压缩失败: {e}")))?;
        decompressed
    } else {
        bytes.to_vec()
    };

    let mut detector = EncodingDetector::new();
    detector.feed(&raw, true);
    let encoding = detector.guess(None, true);
    let (decoded, _, had_errors) = encoding.decode(&raw);
    if had_errors {
        warn!("字幕解码过程中发现错误，可能存在字符丢失");
    }
    Ok(decoded.into_owned())
}
