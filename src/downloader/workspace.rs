use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// 单个任务独占的临时目录：`<temp_root>/<输出文件名去掉扩展名>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempWorkspace {
    root: PathBuf,
    dir: PathBuf,
}

impl TempWorkspace {
    pub fn for_output(temp_root: &Path, output_file_name: &str) -> Self {
        let stem = Path::new(output_file_name)
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| output_file_name.into());
        Self {
            root: temp_root.to_path_buf(),
            dir: temp_root.join(stem),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub async fn create(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// 任务成功后删除整个目录
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// 尽力清理：临时根目录与输出目录为空时删除，非空的工作目录保持不动
    pub async fn cleanup_empty_dirs(&self, output_dir: &Path) {
        for dir in [self.root.as_path(), output_dir] {
            match remove_dir_if_empty(dir).await {
                Ok(true) => debug!("已删除空目录: {:?}", dir),
                Ok(false) => {}
                Err(e) => debug!("清理目录 {:?} 失败: {}", dir, e),
            }
        }
    }
}

async fn remove_dir_if_empty(dir: &Path) -> io::Result<bool> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if entries.next_entry().await?.is_some() {
        return Ok(false);
    }
    tokio::fs::remove_dir(dir).await?;
    Ok(true)
}

/// 已存在且非空的文件长度；给出期望长度时必须完全一致
pub async fn reusable_len(path: &Path, expected: Option<u64>) -> Option<u64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() || meta.len() == 0 {
        return None;
    }
    match expected {
        Some(expected) if expected != meta.len() => None,
        _ => Some(meta.len()),
    }
}

/// 最终文件写入时使用的临时名，保留扩展名以便 ffmpeg 推断容器格式
pub fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{}.part.{}", stem, ext.to_string_lossy()),
        None => format!("{stem}.part"),
    };
    output.with_file_name(name)
}
