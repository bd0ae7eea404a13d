use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::downloader::retry::RetryPolicy;

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败 {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("配置文件格式错误: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("无效的配置项 {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 整数或 "auto"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "AutoOr<usize>")]
pub enum Concurrency {
    #[default]
    Auto,
    Fixed(usize),
}

/// 路径或 "auto"
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "AutoOr<PathBuf>")]
pub enum TempDirSetting {
    #[default]
    Auto,
    Path(PathBuf),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AutoOr<T> {
    Value(T),
    Text(String),
}

impl TryFrom<AutoOr<usize>> for Concurrency {
    type Error = String;

    fn try_from(value: AutoOr<usize>) -> Result<Self, Self::Error> {
        match value {
            AutoOr::Value(0) => Err("并发数必须大于 0".to_string()),
            AutoOr::Value(n) => Ok(Concurrency::Fixed(n)),
            AutoOr::Text(s) if s.eq_ignore_ascii_case("auto") => Ok(Concurrency::Auto),
            AutoOr::Text(s) => s
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map(Concurrency::Fixed)
                .ok_or_else(|| format!("无效的并发数: {s}")),
        }
    }
}

impl TryFrom<AutoOr<PathBuf>> for TempDirSetting {
    type Error = String;

    fn try_from(value: AutoOr<PathBuf>) -> Result<Self, Self::Error> {
        // 字符串总会先匹配 PathBuf，这里再区分 "auto"
        let path = match value {
            AutoOr::Value(path) => path,
            AutoOr::Text(s) => PathBuf::from(s),
        };
        if path.as_os_str().eq_ignore_ascii_case("auto") {
            Ok(TempDirSetting::Auto)
        } else {
            Ok(TempDirSetting::Path(path))
        }
    }
}

impl Concurrency {
    pub fn parse(value: &str) -> Result<Self, String> {
        Self::try_from(AutoOr::Text(value.to_string()))
    }

    pub fn resolve(&self) -> usize {
        match self {
            Concurrency::Fixed(n) => *n,
            Concurrency::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub download_dir: PathBuf,
    pub temp_download_dir: TempDirSetting,
    pub concurrency_per_file: Concurrency,
    pub max_parallel_downloads: usize,
    /// 单次请求超时（秒）
    pub request_timeout: u64,
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    pub ffmpeg_path: Option<String>,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
    pub use_alternate_http_client: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            temp_download_dir: TempDirSetting::Auto,
            concurrency_per_file: Concurrency::Auto,
            max_parallel_downloads: 2,
            request_timeout: 30,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            ffmpeg_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_invalid_certs: false,
            use_alternate_http_client: false,
        }
    }
}

impl DownloaderConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_downloads == 0 {
            return Err(ConfigError::Invalid {
                field: "max_parallel_downloads",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "至少为 1".to_string(),
            });
        }
        Ok(())
    }

    /// 所有任务临时目录的父目录
    pub fn temp_root(&self) -> PathBuf {
        match &self.temp_download_dir {
            TempDirSetting::Path(path) => path.clone(),
            TempDirSetting::Auto => self.download_dir.join("temp_dir"),
        }
    }

    pub fn workers_per_file(&self) -> usize {
        self.concurrency_per_file.resolve()
    }

    /// 环境变量 FFMPEG_PATH 优先于配置文件
    pub fn ffmpeg_command(&self) -> String {
        std::env::var("FFMPEG_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| self.ffmpeg_path.clone())
            .unwrap_or_else(|| "ffmpeg".to_string())
    }
}
