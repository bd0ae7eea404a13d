//! HLS 媒体清单的解析与本地重写。
//!
//! 清单结构交给 `m3u8_rs` 解析，得到分片、密钥与初始化分片。重写阶段按原文逐行输出，
//! 分片行与 `#EXT-X-KEY` / `#EXT-X-MAP` 的 URI 换成临时目录中的文件名，其余行保持不变。
//! 本地清单与分片放在同一目录，ffmpeg 按清单所在目录解析这些相对路径。

use std::collections::{HashMap, HashSet};

use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use url::Url;

use super::error::DownloadError;
use super::models::ChunkDescriptor;
use crate::common::utils::sanitize_file_name;

const KEY_TAG: &str = "#EXT-X-KEY:";
const MAP_TAG: &str = "#EXT-X-MAP:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMode {
    Clear,
    Keyed { method: String, uri: String },
    KeyedWithIv { method: String, uri: String, iv: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ManifestLine {
    Verbatim(String),
    Segment { url: String },
    /// 带 URI 的指令，`uri_span` 为 URI 取值在原行中的字节区间
    Resource {
        line: String,
        uri_span: (usize, usize),
        url: String,
    },
}

#[derive(Debug, Clone)]
pub struct ManifestModel {
    lines: Vec<ManifestLine>,
    key_mode: KeyMode,
    /// 原始顺序（含重复）的分片地址
    segments: Vec<String>,
    /// 去重后的分片与资源地址 -> 本地文件名
    local_names: HashMap<String, String>,
    resources: Vec<String>,
    unique_segments: Vec<String>,
}

impl ManifestModel {
    pub fn parse(manifest_url: &Url, text: &str) -> Result<Self, DownloadError> {
        let text = text.trim_start_matches('\u{feff}');
        let playlist = match m3u8_rs::parse_playlist_res(text.as_bytes()) {
            Ok(Playlist::MediaPlaylist(pl)) => pl,
            Ok(Playlist::MasterPlaylist(_)) => {
                return Err(DownloadError::ManifestError(
                    "收到的是多码率主清单，需要先选择具体分辨率的媒体清单".to_string(),
                ));
            }
            Err(e) => {
                return Err(DownloadError::ManifestError(format!("无法解析 m3u8: {e}")));
            }
        };
        if playlist.segments.is_empty() {
            return Err(DownloadError::ManifestError("清单中没有任何分片".to_string()));
        }

        let key_mode = key_mode(manifest_url, &playlist)?;
        // 原始 URI -> 绝对地址，重写时用来在指令行中定位 URI
        let resource_uris = resource_uris(manifest_url, &playlist)?;
        let segments = playlist
            .segments
            .iter()
            .map(|s| resolve(manifest_url, s.uri.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        let lines = layout(text, &segments, &resource_uris)?;

        let resources = dedup(resource_uris.into_iter().map(|(_, url)| url).collect());
        let unique_segments = dedup(segments.clone());
        let local_names = assign_local_names(resources.iter().chain(unique_segments.iter()));

        Ok(Self {
            lines,
            key_mode,
            segments,
            local_names,
            resources,
            unique_segments,
        })
    }

    pub fn key_mode(&self) -> &KeyMode {
        &self.key_mode
    }

    /// 清单原始顺序的分片地址（保留重复）
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn local_name(&self, url: &str) -> Option<&str> {
        self.local_names.get(url).map(String::as_str)
    }

    /// 密钥 / 初始化分片，先于普通分片下载
    pub fn resource_chunks(&self) -> Vec<ChunkDescriptor> {
        self.to_chunks(&self.resources)
    }

    /// 去重后的分片下载计划，顺序为首次出现的顺序
    pub fn segment_chunks(&self) -> Vec<ChunkDescriptor> {
        self.to_chunks(&self.unique_segments)
    }

    fn to_chunks(&self, urls: &[String]) -> Vec<ChunkDescriptor> {
        urls.iter()
            .filter_map(|url| {
                self.local_names
                    .get(url)
                    .map(|name| ChunkDescriptor::segment(url.clone(), name.clone()))
            })
            .collect()
    }

    /// 生成指向本地文件的清单，写在分片所在目录中，引用一律是文件名
    pub fn rewrite(&self) -> String {
        let local = |url: &str| self.local_name(url).unwrap_or(url).to_string();

        let mut out = String::new();
        for line in &self.lines {
            match line {
                ManifestLine::Verbatim(text) => out.push_str(text),
                ManifestLine::Segment { url } => out.push_str(&local(url)),
                ManifestLine::Resource {
                    line,
                    uri_span: (start, end),
                    url,
                } => {
                    out.push_str(&line[..*start]);
                    out.push_str(&local(url));
                    out.push_str(&line[*end..]);
                }
            }
            out.push('\n');
        }
        out
    }
}

/// `METHOD=NONE` 视为未加密；出现过 IV 后整个清单都按带 IV 处理
fn key_mode(base: &Url, playlist: &MediaPlaylist) -> Result<KeyMode, DownloadError> {
    let mut mode = KeyMode::Clear;
    for key in playlist.segments.iter().filter_map(|s| s.key.as_ref()) {
        if matches!(key.method, KeyMethod::None) {
            continue;
        }
        let method = key.method.to_string();
        let uri = match key.uri.as_deref() {
            Some(uri) if !uri.is_empty() => resolve(base, uri)?,
            _ => {
                return Err(DownloadError::ManifestError(format!(
                    "METHOD={method} 的密钥缺少 URI"
                )));
            }
        };
        mode = match &key.iv {
            Some(iv) => KeyMode::KeyedWithIv {
                method,
                uri,
                iv: iv.clone(),
            },
            None if matches!(mode, KeyMode::KeyedWithIv { .. }) => mode,
            None => KeyMode::Keyed { method, uri },
        };
    }
    Ok(mode)
}

fn resource_uris(base: &Url, playlist: &MediaPlaylist) -> Result<Vec<(String, String)>, DownloadError> {
    let mut uris = Vec::new();
    for segment in &playlist.segments {
        if let Some(key) = &segment.key {
            match (&key.method, key.uri.as_deref()) {
                (KeyMethod::None, _) | (_, None) => {}
                (_, Some(uri)) => uris.push((uri.to_string(), resolve(base, uri)?)),
            }
        }
        if let Some(map) = &segment.map {
            uris.push((map.uri.clone(), resolve(base, &map.uri)?));
        }
    }
    Ok(uris)
}

/// 按原文逐行排列：第 N 个 URI 行对应解析结果中的第 N 个分片
fn layout(
    text: &str,
    segments: &[String],
    resource_uris: &[(String, String)],
) -> Result<Vec<ManifestLine>, DownloadError> {
    let mut lines = Vec::new();
    let mut next_segment = segments.iter();

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim();

        if trimmed.is_empty() {
            lines.push(ManifestLine::Verbatim(line.to_string()));
        } else if trimmed.starts_with('#') {
            let directive = trimmed.starts_with(KEY_TAG) || trimmed.starts_with(MAP_TAG);
            let located = directive
                .then(|| locate_uri(line, resource_uris))
                .flatten();
            match located {
                Some((uri_span, url)) => lines.push(ManifestLine::Resource {
                    line: line.to_string(),
                    uri_span,
                    url,
                }),
                None => lines.push(ManifestLine::Verbatim(line.to_string())),
            }
        } else {
            let url = next_segment.next().ok_or_else(|| {
                DownloadError::ManifestError(format!("多余的分片行: {trimmed}"))
            })?;
            lines.push(ManifestLine::Segment { url: url.clone() });
        }
    }

    if next_segment.next().is_some() {
        return Err(DownloadError::ManifestError(
            "分片行数与解析结果不一致".to_string(),
        ));
    }
    Ok(lines)
}

/// 在指令行里找到 `URI="..."` 的取值区间
fn locate_uri(line: &str, resource_uris: &[(String, String)]) -> Option<((usize, usize), String)> {
    resource_uris.iter().find_map(|(raw, url)| {
        let quoted = format!("URI=\"{raw}\"");
        line.find(&quoted).map(|pos| {
            let start = pos + "URI=\"".len();
            ((start, start + raw.len()), url.clone())
        })
    })
}

/// 相对路径、`//` 开头与绝对地址统一基于清单自身地址解析
fn resolve(base: &Url, reference: &str) -> Result<String, DownloadError> {
    base.join(reference)
        .map(|u| u.to_string())
        .map_err(|e| DownloadError::ManifestError(format!("无法解析地址 {reference}: {e}")))
}

fn dedup(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

/// 本地文件名取自 URL 路径最后一段；不同地址同名时加序号前缀
fn assign_local_names<'a>(urls: impl Iterator<Item = &'a String>) -> HashMap<String, String> {
    let mut names = HashMap::new();
    let mut taken = HashSet::new();
    for (index, url) in urls.enumerate() {
        let base = Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(|s| s.to_string()))
            })
            .map(|s| sanitize_file_name(&s))
            .filter(|s| !s.is_empty() && !s.ends_with(".part"))
            .unwrap_or_else(|| format!("segment{index}.ts"));

        let name = if taken.contains(&base) {
            format!("{index:05}_{base}")
        } else {
            base
        };
        taken.insert(name.clone());
        names.insert(url.clone(), name);
    }
    names
}
