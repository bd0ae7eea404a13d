use async_trait::async_trait;

use crate::downloader::{error::DownloadError, models::ByteRange};

/// 下载引擎唯一依赖的网络能力：按 URL（可带 Range）取回字节，或探测资源长度
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<Vec<u8>, DownloadError>;

    async fn content_length(&self, url: &str) -> Result<u64, DownloadError>;

    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let body = self.fetch(url, None).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}
