use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use url::Url;

use super::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadKind {
    Hls,
    Progressive,
}

impl DownloadKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hls" | "m3u8" => Some(DownloadKind::Hls),
            "mp4" | "progressive" => Some(DownloadKind::Progressive),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadKind::Hls => write!(f, "hls"),
            DownloadKind::Progressive => write!(f, "mp4"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesType {
    Tv,
    Movie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum CipherAlgorithm {
    /// AES-CBC + PKCS#7，密钥长度决定 AES-128/192/256
    #[default]
    #[serde(rename = "aes-cbc", alias = "aes", alias = "AES", alias = "aes-128-cbc")]
    AesCbc,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubtitleCipherSpec {
    pub key: String,
    pub iv: String,
    #[serde(default)]
    pub algorithm: CipherAlgorithm,
}

// --------------------------------------------------------------------
// 上游解析器给出的原始描述（JSON）

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadDescriptor {
    #[serde(alias = "downloadLink")]
    pub link: Option<String>,
    #[serde(rename = "type", alias = "downloadType")]
    pub kind: Option<String>,
    #[serde(alias = "refererLink")]
    pub referer: Option<String>,
    #[serde(alias = "episodeName")]
    pub output_file_name: String,
    #[serde(default)]
    pub subtitles: BTreeMap<String, String>,
    #[serde(default)]
    pub subtitle_decryption: BTreeMap<String, SubtitleCipherSpec>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    pub series_type: Option<SeriesType>,
    pub season: Option<u32>,
    /// 上游解析失败时携带的原因
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleTrack {
    pub label: String,
    pub url: String,
}

/// 校验后的下载任务描述，任务开始后不再变化
#[derive(Debug, Clone)]
pub struct DownloadJobSpec {
    pub link: Url,
    pub kind: DownloadKind,
    pub referer: Option<String>,
    pub output_file_name: String,
    pub output_dir: PathBuf,
    pub subtitles: Vec<SubtitleTrack>,
    pub subtitle_decryption: BTreeMap<String, SubtitleCipherSpec>,
    pub cookies: BTreeMap<String, String>,
}

impl DownloadJobSpec {
    pub fn new(
        link: &str,
        kind: DownloadKind,
        output_file_name: &str,
        output_dir: impl AsRef<Path>,
    ) -> Result<Self, DownloadError> {
        let link = Url::parse(link).map_err(|e| DownloadError::InvalidUrl(format!("{link}: {e}")))?;
        if !matches!(link.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!("不支持的协议: {link}")));
        }

        let name = output_file_name.trim();
        if name.is_empty() {
            return Err(DownloadError::InvalidDescriptor("输出文件名为空".to_string()));
        }
        if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(DownloadError::InvalidDescriptor(format!(
                "输出文件名不能包含路径: {name}"
            )));
        }

        Ok(Self {
            link,
            kind,
            referer: None,
            output_file_name: name.to_string(),
            output_dir: output_dir.as_ref().to_path_buf(),
            subtitles: Vec::new(),
            subtitle_decryption: BTreeMap::new(),
            cookies: BTreeMap::new(),
        })
    }

    /// 由上游描述构造；缺少链接或类型未知时返回跳过原因
    pub fn from_descriptor(
        descriptor: &DownloadDescriptor,
        download_dir: &Path,
    ) -> Result<Self, DownloadError> {
        let link = match (&descriptor.link, &descriptor.error) {
            (Some(link), _) if !link.trim().is_empty() => link.trim(),
            (_, Some(err)) => return Err(DownloadError::InvalidDescriptor(err.clone())),
            _ => return Err(DownloadError::InvalidDescriptor("缺少下载链接".to_string())),
        };

        let raw_kind = descriptor.kind.as_deref().unwrap_or_default();
        let kind = DownloadKind::parse(raw_kind).ok_or_else(|| {
            DownloadError::InvalidDescriptor(format!("unknown download type [{raw_kind}]"))
        })?;

        let output_dir = match (descriptor.series_type, descriptor.season) {
            (Some(SeriesType::Tv), Some(season)) => {
                download_dir.join(format!("Season-{season:02}"))
            }
            _ => download_dir.to_path_buf(),
        };

        let mut spec = Self::new(link, kind, &descriptor.output_file_name, output_dir)?;
        spec.referer = descriptor
            .referer
            .as_ref()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        spec.subtitles = descriptor
            .subtitles
            .iter()
            .map(|(label, url)| SubtitleTrack {
                label: label.clone(),
                url: url.clone(),
            })
            .collect();
        spec.subtitle_decryption = descriptor.subtitle_decryption.clone();
        spec.cookies = descriptor.cookies.clone();
        Ok(spec)
    }

    pub fn with_subtitle(mut self, label: impl Into<String>, url: impl Into<String>) -> Self {
        self.subtitles.push(SubtitleTrack {
            label: label.into(),
            url: url.into(),
        });
        self
    }

    pub fn with_subtitle_cipher(mut self, label: impl Into<String>, spec: SubtitleCipherSpec) -> Self {
        self.subtitle_decryption.insert(label.into(), spec);
        self
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.output_file_name)
    }
}

// --------------------------------------------------------------------

/// 闭区间字节范围，对应 `Range: bytes=start-end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub url: String,
    pub range: Option<ByteRange>,
    /// 已知的期望长度（分块下载时可计算，HLS 分片未知）
    pub expected_len: Option<u64>,
    pub local_name: String,
}

impl ChunkDescriptor {
    pub fn segment(url: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
            expected_len: None,
            local_name: local_name.into(),
        }
    }
}

/// 分块文件名：`<输出文件名>.chunk<序号>`
pub fn chunk_file_name(output_file_name: &str, index: u64) -> String {
    format!("{output_file_name}.chunk{index}")
}

/// 按固定块大小切分 `[0, total)`，Range 的结束位置固定为 `start + chunk_size - 1`
pub fn plan_chunks(
    url: &str,
    total_size: u64,
    chunk_size: u64,
    output_file_name: &str,
) -> Vec<ChunkDescriptor> {
    let chunk_size = chunk_size.max(1);
    (0..total_size.div_ceil(chunk_size))
        .map(|index| {
            let start = index * chunk_size;
            ChunkDescriptor {
                url: url.to_string(),
                range: Some(ByteRange {
                    start,
                    end: start + chunk_size - 1,
                }),
                expected_len: Some(chunk_size.min(total_size - start)),
                local_name: chunk_file_name(output_file_name, index),
            }
        })
        .collect()
}
