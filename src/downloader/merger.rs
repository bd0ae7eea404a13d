use std::path::Path;

use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use super::error::DownloadError;
use super::models::ChunkDescriptor;
use super::workspace::partial_path;

/// 把分块按序号拼接成最终文件
pub struct ChunkAssembler;

impl ChunkAssembler {
    /// `chunks` 必须按序号排列。写入 `<输出>.part.<扩展名>`，长度校验通过后改名到最终位置；
    /// 每个分块写入后立即删除，失败时剩余分块保留在临时目录中。
    pub async fn concat(
        workspace_dir: &Path,
        chunks: &[ChunkDescriptor],
        output_path: &Path,
    ) -> Result<u64, DownloadError> {
        let expected: u64 = chunks.iter().filter_map(|c| c.expected_len).sum();
        for chunk in chunks {
            let path = workspace_dir.join(&chunk.local_name);
            if !fs::try_exists(&path).await.unwrap_or(false) {
                return Err(DownloadError::FileNotFound(path));
            }
        }

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(output_path);
        debug!("开始合并 {} 个分块 -> {:?}", chunks.len(), partial);

        let written = match Self::write_all(workspace_dir, chunks, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if written != expected {
            let _ = fs::remove_file(&partial).await;
            return Err(DownloadError::MergeError(format!(
                "合并后大小 {written} 与预期 {expected} 不符"
            )));
        }

        fs::rename(&partial, output_path).await?;
        info!("✅ 分块合并完成，输出文件: {:?}", output_path);
        Ok(written)
    }

    async fn write_all(
        workspace_dir: &Path,
        chunks: &[ChunkDescriptor],
        partial: &Path,
    ) -> Result<u64, DownloadError> {
        let mut out = BufWriter::new(File::create(partial).await?);
        let mut written = 0;
        for chunk in chunks {
            let path = workspace_dir.join(&chunk.local_name);
            let mut input = File::open(&path).await?;
            written += io::copy(&mut input, &mut out).await?;
            drop(input);
            fs::remove_file(&path).await?;
        }
        out.flush().await?;
        out.into_inner().sync_all().await?;
        Ok(written)
    }
}
