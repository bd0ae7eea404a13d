use std::collections::BTreeMap;
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use cookie_store::CookieStore;
use reqwest::{
    Client, ClientBuilder, Response, StatusCode,
    header::{ACCEPT_ENCODING, CONNECTION, HeaderMap, HeaderValue, RANGE, REFERER, USER_AGENT},
};
use reqwest_cookie_store::CookieStoreMutex;
use tracing::{debug, warn};
use url::Url;

use super::transport::Transport;
use crate::common::config::DownloaderConfig;
use crate::downloader::{error::DownloadError, models::ByteRange};

/// 单个任务共享的 HTTP 会话：默认请求头、Referer、超时与只读的 Cookie
#[derive(Debug, Clone)]
pub struct MediaClient {
    pub inner: Client,
    pub cookie_store: Arc<CookieStoreMutex>,
}

impl MediaClient {
    /// `cookies` 由上游解析器取得，绑定到 `cookie_url` 所在域
    pub fn with_cookies(
        config: &DownloaderConfig,
        referer: Option<&str>,
        cookie_url: Option<&Url>,
        cookies: &BTreeMap<String, String>,
    ) -> Result<Self, DownloadError> {
        let mut store = CookieStore::default();
        if let Some(url) = cookie_url {
            for (name, value) in cookies {
                if let Err(e) = store.parse(&format!("{name}={value}"), url) {
                    warn!("忽略无效的 Cookie {}: {}", name, e);
                }
            }
        }
        let cookie_store = Arc::new(CookieStoreMutex::new(store));

        let headers = Self::get_default_headers(&config.user_agent, referer)?;
        let inner = ClientBuilder::new()
            .timeout(Duration::from_secs(config.request_timeout.max(1)))
            .cookie_provider(Arc::clone(&cookie_store))
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            inner,
            cookie_store,
        })
    }

    pub fn get_default_headers(
        user_agent: &str,
        referer: Option<&str>,
    ) -> Result<HeaderMap, DownloadError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|e| DownloadError::InvalidDescriptor(format!("User-Agent 无效: {e}")))?,
        );
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("*"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        if let Some(referer) = referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer)
                    .map_err(|e| DownloadError::InvalidDescriptor(format!("Referer 无效: {e}")))?,
            );
        }
        Ok(headers)
    }

    pub async fn get_raw_response(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<Response, DownloadError> {
        let mut request = self.inner.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }
        let resp = request.send().await?;
        Self::check_response_status(&resp, url)?;
        Ok(resp)
    }

    // 只接受 200 与 206（分块下载时的部分内容）
    fn check_response_status(response: &Response, url: &str) -> Result<(), DownloadError> {
        let status = response.status();
        debug!("Response Status: {} ({})", status, url);
        match status {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(()),
            status => Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Transport for MediaClient {
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<Vec<u8>, DownloadError> {
        let resp = self.get_raw_response(url, range).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn content_length(&self, url: &str) -> Result<u64, DownloadError> {
        // 只读取响应头，丢弃响应体
        let resp = self.get_raw_response(url, None).await?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .unwrap_or("application/octet-stream");
        // 返回 HTML 通常是错误页面而不是文件
        if content_type.contains("text/html") {
            warn!("URL 返回 HTML 内容，可能不是文件下载链接: {}", url);
            return Err(DownloadError::InvalidUrl(format!("URL 返回 HTML 内容: {url}")));
        }

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse::<u64>().ok())
            .unwrap_or(0);

        if size == 0 {
            return Err(DownloadError::UnknownSize(url.to_string()));
        }
        Ok(size)
    }
}
