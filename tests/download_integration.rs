use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use indicatif::{MultiProgress, ProgressDrawTarget};

use media_downloader::common::client::transport::Transport;
use media_downloader::common::config::{Concurrency, DownloaderConfig, TempDirSetting};
use media_downloader::downloader::error::DownloadError;
use media_downloader::downloader::models::{
    ByteRange, CipherAlgorithm, DownloadDescriptor, DownloadJobSpec, DownloadKind,
    SubtitleCipherSpec,
};
use media_downloader::downloader::retry::RetryPolicy;
use media_downloader::downloader::task::JobStatus;
use media_downloader::post_process::merger::{Remuxer, SubtitleInput};
use media_downloader::{DownloadJob, DownloadManager};

const VIDEO_URL: &str = "http://host/video.mp4";

/// 内存中的网络层：记录每次请求，可以让指定分块一直失败或延迟返回
#[derive(Default)]
struct MemoryTransport {
    resources: HashMap<String, Vec<u8>>,
    failing: HashSet<(String, u64)>,
    delays_ms: HashMap<u64, u64>,
    hits: Mutex<Vec<(String, Option<u64>)>>,
}

impl MemoryTransport {
    fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.resources.insert(url.to_string(), body.into());
        self
    }

    fn failing_at(mut self, url: &str, start: u64) -> Self {
        self.failing.insert((url.to_string(), start));
        self
    }

    fn delayed_at(mut self, start: u64, ms: u64) -> Self {
        self.delays_ms.insert(start, ms);
        self
    }

    fn hit_starts(&self, url: &str) -> Vec<u64> {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .filter_map(|(_, start)| *start)
            .collect()
    }

    fn hit_count(&self) -> usize {
        self.hits.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<Vec<u8>, DownloadError> {
        let start = range.map(|r| r.start);
        self.hits.lock().unwrap().push((url.to_string(), start));

        if self.failing.contains(&(url.to_string(), start.unwrap_or(0))) {
            return Err(DownloadError::HttpStatus {
                status: 503,
                url: url.to_string(),
            });
        }
        if let Some(ms) = start.and_then(|s| self.delays_ms.get(&s)) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }

        let body = self.resources.get(url).ok_or_else(|| DownloadError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })?;
        Ok(match range {
            Some(r) => {
                let end = ((r.end + 1) as usize).min(body.len());
                body[r.start as usize..end].to_vec()
            }
            None => body.clone(),
        })
    }

    async fn content_length(&self, url: &str) -> Result<u64, DownloadError> {
        self.resources
            .get(url)
            .map(|b| b.len() as u64)
            .ok_or_else(|| DownloadError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

/// 代替 ffmpeg：按本地清单顺序拼接分片，并记录封装时看到的内容。
/// 与 ffmpeg 一致，清单中的相对路径基于清单所在目录解析。
#[derive(Default)]
struct ConcatRemuxer {
    playlist: Mutex<Option<String>>,
    missing: Mutex<Vec<String>>,
    subtitles: Mutex<Vec<(String, String)>>,
}

impl ConcatRemuxer {
    fn record_subtitles(&self, subtitles: &[SubtitleInput]) {
        let mut seen = self.subtitles.lock().unwrap();
        for sub in subtitles {
            let text = std::fs::read_to_string(&sub.path).unwrap_or_default();
            seen.push((sub.label.clone(), text));
        }
    }
}

#[async_trait]
impl Remuxer for ConcatRemuxer {
    async fn remux_playlist(
        &self,
        playlist: &Path,
        subtitles: &[SubtitleInput],
        output: &Path,
    ) -> Result<(), DownloadError> {
        let text = std::fs::read_to_string(playlist)?;
        let base = playlist.parent().unwrap_or(Path::new(""));
        let mut data = Vec::new();
        for line in text.lines() {
            let local = if line.starts_with('#') {
                match line.split_once("URI=\"") {
                    Some((_, rest)) => rest.trim_end_matches('"').to_string(),
                    None => continue,
                }
            } else if line.trim().is_empty() {
                continue;
            } else {
                line.to_string()
            };
            match std::fs::read(base.join(&local)) {
                Ok(bytes) if !line.starts_with('#') => data.extend(bytes),
                Ok(_) => {}
                Err(_) => self.missing.lock().unwrap().push(local),
            }
        }
        self.record_subtitles(subtitles);
        *self.playlist.lock().unwrap() = Some(text);
        std::fs::write(output, data)?;
        Ok(())
    }

    async fn mux_subtitles(
        &self,
        video: &Path,
        subtitles: &[SubtitleInput],
        output: &Path,
    ) -> Result<(), DownloadError> {
        self.record_subtitles(subtitles);
        std::fs::copy(video, output)?;
        Ok(())
    }
}

fn test_config(root: &Path, chunk_size: u64) -> DownloaderConfig {
    DownloaderConfig {
        download_dir: root.join("out"),
        temp_download_dir: TempDirSetting::Path(root.join("tmp")),
        concurrency_per_file: Concurrency::Fixed(4),
        chunk_size,
        retry: RetryPolicy::new(3, Duration::ZERO, 2),
        ..DownloaderConfig::default()
    }
}

fn progressive_job(
    config: &Arc<DownloaderConfig>,
    name: &str,
    transport: &Arc<MemoryTransport>,
    remuxer: &Arc<ConcatRemuxer>,
) -> DownloadJob {
    let spec =
        DownloadJobSpec::new(VIDEO_URL, DownloadKind::Progressive, name, &config.download_dir).unwrap();
    DownloadJob::new(spec, Arc::clone(config))
        .with_transport(Arc::clone(transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::clone(remuxer) as Arc<dyn Remuxer>)
}

fn workspace_dir(config: &DownloaderConfig, stem: &str) -> PathBuf {
    config.temp_root().join(stem)
}

#[tokio::test]
async fn existing_output_is_skipped_without_touching_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let transport = Arc::new(MemoryTransport::default().with(VIDEO_URL, b"0123456789".to_vec()));
    let remuxer = Arc::new(ConcatRemuxer::default());

    std::fs::create_dir_all(&config.download_dir).unwrap();
    std::fs::write(config.download_dir.join("v.mp4"), b"finished").unwrap();
    let ws = workspace_dir(&config, "v");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("v.mp4.chunk0"), b"0123").unwrap();

    let report = progressive_job(&config, "v.mp4", &transport, &remuxer).run().await;

    assert_eq!(report.status, JobStatus::Skipped("exists".to_string()));
    assert!(report.to_string().ends_with("v.mp4: skipped (exists)"));
    assert_eq!(std::fs::read(config.download_dir.join("v.mp4")).unwrap(), b"finished");
    assert_eq!(std::fs::read(ws.join("v.mp4.chunk0")).unwrap(), b"0123");
    assert_eq!(transport.hit_count(), 0);
}

#[tokio::test]
async fn complete_chunk_is_reused_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let transport = Arc::new(MemoryTransport::default().with(VIDEO_URL, b"0123456789".to_vec()));
    let remuxer = Arc::new(ConcatRemuxer::default());

    let ws = workspace_dir(&config, "v");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("v.mp4.chunk1"), b"4567").unwrap();
    // 长度不符的分块必须重新下载
    std::fs::write(ws.join("v.mp4.chunk2"), b"8").unwrap();

    let report = progressive_job(&config, "v.mp4", &transport, &remuxer).run().await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    let starts = transport.hit_starts(VIDEO_URL);
    assert!(!starts.contains(&4));
    assert!(starts.contains(&0) && starts.contains(&8));

    let progress = report.progress.unwrap();
    assert_eq!(progress.reused_count, 1);
    assert_eq!(progress.reused, 4);
    assert_eq!(progress.downloaded, 6);
    assert_eq!(
        std::fs::read(config.download_dir.join("v.mp4")).unwrap(),
        b"0123456789"
    );
    assert!(!ws.exists());
}

#[tokio::test]
async fn assembly_follows_index_not_completion_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    // 完成顺序为 2, 0, 1
    let transport = Arc::new(
        MemoryTransport::default()
            .with(VIDEO_URL, b"AAAABBBBCC".to_vec())
            .delayed_at(0, 60)
            .delayed_at(4, 150),
    );
    let remuxer = Arc::new(ConcatRemuxer::default());

    let report = progressive_job(&config, "v.mp4", &transport, &remuxer).run().await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    assert_eq!(
        std::fs::read(config.download_dir.join("v.mp4")).unwrap(),
        b"AAAABBBBCC"
    );
}

#[tokio::test]
async fn partial_failure_reports_counts_and_keeps_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let body: Vec<u8> = (0..40u8).collect();
    let transport = Arc::new(
        MemoryTransport::default()
            .with(VIDEO_URL, body)
            .failing_at(VIDEO_URL, 8)
            .failing_at(VIDEO_URL, 24),
    );
    let remuxer = Arc::new(ConcatRemuxer::default());

    let report = progressive_job(&config, "v.mp4", &transport, &remuxer).run().await;

    let JobStatus::Failed(reason) = &report.status else {
        panic!("expected failure, got {report}");
    };
    assert!(reason.contains("2 / 10"), "{reason}");
    assert!(report.to_string().contains("v.mp4"));

    // 每个失败的分块都按重试策略请求了 3 次
    let starts = transport.hit_starts(VIDEO_URL);
    assert_eq!(starts.iter().filter(|s| **s == 8).count(), 3);

    let ws = workspace_dir(&config, "v");
    let kept = std::fs::read_dir(&ws)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".chunk"))
        .count();
    assert_eq!(kept, 8);
    assert!(!config.download_dir.join("v.mp4").exists());
}

#[tokio::test]
async fn three_mebibyte_file_in_three_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 1_048_576));
    let body: Vec<u8> = (0..3_145_728u32).map(|i| (i % 251) as u8).collect();
    let transport = Arc::new(MemoryTransport::default().with(VIDEO_URL, body.clone()));
    let remuxer = Arc::new(ConcatRemuxer::default());

    let name = "Show Episode 1 - 720P.mp4";
    let report = progressive_job(&config, name, &transport, &remuxer).run().await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    let mut starts = transport.hit_starts(VIDEO_URL);
    starts.sort();
    assert_eq!(starts, [0, 1_048_576, 2_097_152]);

    let output = std::fs::read(config.download_dir.join(name)).unwrap();
    assert_eq!(output.len(), 3_145_728);
    assert_eq!(output, body);
}

const MANIFEST_URL: &str = "http://host/hls/720/index.m3u8";

const MANIFEST: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-KEY:METHOD=AES-128,URI=\"/keys/enc.key\"
#EXTINF:6.0,
seg0.ts
#EXTINF:6.0,
//cdn.host/hls/seg1.ts
#EXTINF:6.0,
http://host/hls/720/seg2.ts
#EXTINF:6.0,
seg0.ts
#EXT-X-ENDLIST
";

fn hls_transport() -> MemoryTransport {
    MemoryTransport::default()
        .with(MANIFEST_URL, MANIFEST)
        .with("http://host/keys/enc.key", b"0123456789abcdef".to_vec())
        .with("http://host/hls/720/seg0.ts", b"S0".to_vec())
        .with("http://cdn.host/hls/seg1.ts", b"S1".to_vec())
        .with("http://host/hls/720/seg2.ts", b"S2".to_vec())
}

#[tokio::test]
async fn hls_manifest_is_rewritten_to_local_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let transport = Arc::new(hls_transport());
    let remuxer = Arc::new(ConcatRemuxer::default());

    let spec =
        DownloadJobSpec::new(MANIFEST_URL, DownloadKind::Hls, "Show Episode 2 - 720P.mp4", &config.download_dir)
            .unwrap();
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::clone(&remuxer) as Arc<dyn Remuxer>)
        .run()
        .await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    assert_eq!(report.progress.unwrap().total, 3);
    assert!(remuxer.missing.lock().unwrap().is_empty());

    // 重复分片只下载一次
    assert_eq!(
        transport
            .hits
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == "http://host/hls/720/seg0.ts")
            .count(),
        1
    );

    let ws = workspace_dir(&config, "Show Episode 2 - 720P");
    let rewritten = remuxer.playlist.lock().unwrap().clone().unwrap();
    let original: Vec<&str> = MANIFEST.lines().collect();
    let lines: Vec<&str> = rewritten.lines().collect();
    assert_eq!(lines.len(), original.len());

    let segment_lines: Vec<&str> = lines.iter().copied().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(segment_lines.len(), 4);
    assert_eq!(segment_lines[0], segment_lines[3]);
    assert_eq!(segment_lines, ["seg0.ts", "seg1.ts", "seg2.ts", "seg0.ts"]);
    assert_eq!(lines[3], "#EXT-X-KEY:METHOD=AES-128,URI=\"enc.key\"");
    assert!(!ws.exists());
    for (a, b) in original.iter().zip(&lines) {
        if a.starts_with('#') && !a.starts_with("#EXT-X-KEY") {
            assert_eq!(a, b);
        }
    }

    let output = std::fs::read(config.download_dir.join("Show Episode 2 - 720P.mp4")).unwrap();
    assert_eq!(output, b"S0S1S2S0");
}

#[tokio::test]
async fn hls_key_with_iv_fails_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let manifest = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k.key\",IV=0x00000000000000000000000000000001\n#EXTINF:6,\nseg0.ts\n";
    let transport = Arc::new(MemoryTransport::default().with(MANIFEST_URL, manifest));
    let remuxer = Arc::new(ConcatRemuxer::default());

    let spec = DownloadJobSpec::new(MANIFEST_URL, DownloadKind::Hls, "e.mp4", &config.download_dir).unwrap();
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::clone(&remuxer) as Arc<dyn Remuxer>)
        .run()
        .await;

    let JobStatus::Failed(reason) = &report.status else {
        panic!("expected failure, got {report}");
    };
    assert!(reason.contains("IV"), "{reason}");
    assert!(remuxer.playlist.lock().unwrap().is_none());
    assert_eq!(transport.hit_count(), 1);
}

const SUB_KEY: &str = "0123456789abcdef";
const SUB_IV: &str = "fedcba9876543210";

fn encrypt_line(text: &str) -> String {
    let mut buf = text.as_bytes().to_vec();
    buf.resize(text.len() + 16, 0);
    let ct = cbc::Encryptor::<aes::Aes128>::new_from_slices(SUB_KEY.as_bytes(), SUB_IV.as_bytes())
        .unwrap()
        .encrypt_padded_mut::<Pkcs7>(&mut buf, text.len())
        .unwrap()
        .to_vec();
    STANDARD.encode(ct)
}

#[tokio::test]
async fn undecryptable_subtitle_lines_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let sub_url = "http://subs.host/ep1/English.srt";
    let subtitle = format!(
        "1\n00:00:01,000 --> 00:00:02,000\n{}\n\nnot-a-ciphertext!\n",
        encrypt_line("Hello there")
    );
    let transport = Arc::new(
        MemoryTransport::default()
            .with(VIDEO_URL, b"0123456789".to_vec())
            .with(sub_url, subtitle),
    );
    let remuxer = Arc::new(ConcatRemuxer::default());

    let spec = DownloadJobSpec::new(VIDEO_URL, DownloadKind::Progressive, "v.mp4", &config.download_dir)
        .unwrap()
        .with_subtitle("English", sub_url)
        .with_subtitle_cipher(
            "English",
            SubtitleCipherSpec {
                key: SUB_KEY.into(),
                iv: SUB_IV.into(),
                algorithm: CipherAlgorithm::AesCbc,
            },
        );
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::clone(&remuxer) as Arc<dyn Remuxer>)
        .run()
        .await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    let seen = remuxer.subtitles.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "English");
    assert_eq!(
        seen[0].1,
        "1\n00:00:01,000 --> 00:00:02,000\nHello there\n\nnot-a-ciphertext!\n"
    );
    assert_eq!(
        std::fs::read(config.download_dir.join("v.mp4")).unwrap(),
        b"0123456789"
    );
    assert!(!config.download_dir.join("v.subs.mp4").exists());
}

#[tokio::test]
async fn missing_subtitle_is_dropped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let transport = Arc::new(MemoryTransport::default().with(VIDEO_URL, b"0123456789".to_vec()));
    let remuxer = Arc::new(ConcatRemuxer::default());

    let spec = DownloadJobSpec::new(VIDEO_URL, DownloadKind::Progressive, "v.mp4", &config.download_dir)
        .unwrap()
        .with_subtitle("English", "http://subs.host/gone.srt");
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::clone(&remuxer) as Arc<dyn Remuxer>)
        .run()
        .await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    assert!(remuxer.subtitles.lock().unwrap().is_empty());
}

#[tokio::test]
async fn batch_reports_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 4);
    config.max_parallel_downloads = 2;
    let config = Arc::new(config);
    let transport = Arc::new(MemoryTransport::default().with(VIDEO_URL, b"0123456789".to_vec()));
    let remuxer = Arc::new(ConcatRemuxer::default());

    let descriptors: Vec<DownloadDescriptor> = serde_json::from_str(&format!(
        r#"[
            {{"link": "{VIDEO_URL}", "type": "mp4", "outputFileName": "a.mp4"}},
            {{"error": "geo blocked", "outputFileName": "b.mp4"}},
            {{"link": "{VIDEO_URL}", "type": "mp4", "outputFileName": "a.mkv"}},
            {{"link": "{VIDEO_URL}", "type": "dash", "outputFileName": "c.mp4"}},
            {{"link": "{VIDEO_URL}", "type": "mp4", "outputFileName": "Show Episode 3 - 720P.mp4",
              "seriesType": "tv", "season": 1}}
        ]"#
    ))
    .unwrap();

    let factory_transport = Arc::clone(&transport);
    let manager = DownloadManager::new(Arc::clone(&config))
        .with_progress(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
        .with_remuxer(Arc::clone(&remuxer) as Arc<dyn Remuxer>)
        .with_transport_factory(Arc::new(move |_spec: &DownloadJobSpec| {
            Ok::<_, DownloadError>(Arc::clone(&factory_transport) as Arc<dyn Transport>)
        }));

    let reports = manager.run_descriptors(descriptors).await;

    let names: Vec<&str> = reports.iter().map(|r| r.file_name.as_str()).collect();
    assert_eq!(
        names,
        ["a.mp4", "b.mp4", "a.mkv", "c.mp4", "Show Episode 3 - 720P.mp4"]
    );
    assert!(matches!(reports[0].status, JobStatus::Completed(_)));
    assert_eq!(reports[1].status, JobStatus::Skipped("geo blocked".to_string()));
    assert!(matches!(&reports[2].status, JobStatus::Skipped(r) if r.contains("a.mp4")));
    assert!(matches!(&reports[3].status, JobStatus::Skipped(r) if r.contains("dash")));
    assert!(matches!(reports[4].status, JobStatus::Completed(_)));

    assert!(config.download_dir.join("Season-01").join("Show Episode 3 - 720P.mp4").exists());
    assert!(!config.download_dir.join("a.mkv").exists());
    assert!(!config.temp_root().exists());
}

#[tokio::test]
async fn cancelled_batch_leaves_jobs_unstarted() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let transport = Arc::new(MemoryTransport::default().with(VIDEO_URL, b"0123456789".to_vec()));

    let factory_transport = Arc::clone(&transport);
    let manager = DownloadManager::new(Arc::clone(&config))
        .with_progress(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
        .with_remuxer(Arc::new(ConcatRemuxer::default()) as Arc<dyn Remuxer>)
        .with_transport_factory(Arc::new(move |_spec: &DownloadJobSpec| {
            Ok::<_, DownloadError>(Arc::clone(&factory_transport) as Arc<dyn Transport>)
        }));
    manager.cancellation_token().cancel();

    let spec = DownloadJobSpec::new(VIDEO_URL, DownloadKind::Progressive, "v.mp4", &config.download_dir).unwrap();
    let reports = manager.run_batch(vec![spec]).await;

    assert_eq!(reports[0].status, JobStatus::Cancelled);
    assert_eq!(transport.hit_count(), 0);
}

#[tokio::test]
async fn hls_playlist_resolves_from_its_own_directory_under_relative_root() {
    // 默认配置下保存目录是相对路径
    let dir = tempfile::tempdir_in(".").unwrap();
    assert!(dir.path().is_relative());
    let config = Arc::new(DownloaderConfig {
        download_dir: dir.path().join("downloads"),
        temp_download_dir: TempDirSetting::Auto,
        concurrency_per_file: Concurrency::Fixed(2),
        retry: RetryPolicy::new(3, Duration::ZERO, 2),
        ..DownloaderConfig::default()
    });
    let transport = Arc::new(hls_transport());
    let remuxer = Arc::new(ConcatRemuxer::default());

    let spec = DownloadJobSpec::new(MANIFEST_URL, DownloadKind::Hls, "e.mp4", &config.download_dir).unwrap();
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::clone(&remuxer) as Arc<dyn Remuxer>)
        .run()
        .await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    assert_eq!(*remuxer.missing.lock().unwrap(), Vec::<String>::new());
    assert_eq!(
        std::fs::read(config.download_dir.join("e.mp4")).unwrap(),
        b"S0S1S2S0"
    );
}

#[tokio::test]
async fn hls_rerun_reuses_downloaded_segments() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let transport = Arc::new(hls_transport());
    let remuxer = Arc::new(ConcatRemuxer::default());

    let ws = workspace_dir(&config, "e");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("enc.key"), b"0123456789abcdef").unwrap();
    std::fs::write(ws.join("seg0.ts"), b"S0").unwrap();
    // 中断留下的半截文件不算已下载
    std::fs::write(ws.join("seg1.ts.part"), b"S").unwrap();

    let spec = DownloadJobSpec::new(MANIFEST_URL, DownloadKind::Hls, "e.mp4", &config.download_dir).unwrap();
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::clone(&remuxer) as Arc<dyn Remuxer>)
        .run()
        .await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    let hit_urls: Vec<String> = transport.hits.lock().unwrap().iter().map(|(u, _)| u.clone()).collect();
    assert!(!hit_urls.iter().any(|u| u == "http://host/hls/720/seg0.ts"));
    assert!(!hit_urls.iter().any(|u| u == "http://host/keys/enc.key"));
    assert!(hit_urls.iter().any(|u| u == "http://cdn.host/hls/seg1.ts"));

    let progress = report.progress.unwrap();
    assert_eq!(progress.reused_count, 1);
    assert_eq!(progress.total, 3);
    assert_eq!(
        std::fs::read(config.download_dir.join("e.mp4")).unwrap(),
        b"S0S1S2S0"
    );
}

#[tokio::test]
async fn hls_missing_key_fails_before_segments() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let transport = Arc::new(
        MemoryTransport::default()
            .with(MANIFEST_URL, MANIFEST)
            .with("http://host/hls/720/seg0.ts", b"S0".to_vec()),
    );
    let remuxer = Arc::new(ConcatRemuxer::default());

    let spec = DownloadJobSpec::new(MANIFEST_URL, DownloadKind::Hls, "e.mp4", &config.download_dir).unwrap();
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::clone(&remuxer) as Arc<dyn Remuxer>)
        .run()
        .await;

    let JobStatus::Failed(reason) = &report.status else {
        panic!("expected failure, got {report}");
    };
    assert!(reason.contains("密钥或初始化分片"), "{reason}");
    assert!(!transport.hits.lock().unwrap().iter().any(|(u, _)| u.ends_with(".ts")));
    assert!(remuxer.playlist.lock().unwrap().is_none());
    assert!(!config.download_dir.join("e.mp4").exists());
}

/// 第二遍封装失败的替身：先写出半截文件再报错
struct BrokenMuxRemuxer;

#[async_trait]
impl Remuxer for BrokenMuxRemuxer {
    async fn remux_playlist(
        &self,
        _playlist: &Path,
        _subtitles: &[SubtitleInput],
        _output: &Path,
    ) -> Result<(), DownloadError> {
        Err(DownloadError::FfmpegError("unused".to_string()))
    }

    async fn mux_subtitles(
        &self,
        _video: &Path,
        _subtitles: &[SubtitleInput],
        output: &Path,
    ) -> Result<(), DownloadError> {
        std::fs::write(output, b"half")?;
        Err(DownloadError::FfmpegError("Conversion failed!".to_string()))
    }
}

#[tokio::test]
async fn failed_subtitle_mux_keeps_plain_video() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let sub_url = "http://subs.host/ep1/English.srt";
    let transport = Arc::new(
        MemoryTransport::default()
            .with(VIDEO_URL, b"0123456789".to_vec())
            .with(sub_url, "1\n00:00:01,000 --> 00:00:02,000\nHello\n"),
    );

    let spec = DownloadJobSpec::new(VIDEO_URL, DownloadKind::Progressive, "v.mp4", &config.download_dir)
        .unwrap()
        .with_subtitle("English", sub_url);
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::new(BrokenMuxRemuxer) as Arc<dyn Remuxer>)
        .run()
        .await;

    assert!(matches!(report.status, JobStatus::Completed(_)), "{report}");
    assert_eq!(
        std::fs::read(config.download_dir.join("v.mp4")).unwrap(),
        b"0123456789"
    );
    assert!(!config.download_dir.join("v.subs.mp4").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn ffmpeg_failure_carries_stderr_and_leaves_no_output() {
    use std::os::unix::fs::PermissionsExt;

    use media_downloader::post_process::merger::FfmpegRemuxer;

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path(), 4));
    let transport = Arc::new(hls_transport());

    // 假的 ffmpeg：-version 正常，封装时写出半截输出后以非零状态退出
    let script = dir.path().join("fake-ffmpeg");
    std::fs::write(
        &script,
        "#!/bin/sh\n\
         if [ \"$1\" = \"-version\" ]; then exit 0; fi\n\
         for last; do :; done\n\
         printf 'partial' > \"$last\"\n\
         echo '[hls @ 0x1] Failed to open segment 2' >&2\n\
         echo 'playlist.m3u8: Invalid data found when processing input' >&2\n\
         exit 1\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let spec = DownloadJobSpec::new(MANIFEST_URL, DownloadKind::Hls, "e.mp4", &config.download_dir).unwrap();
    let report = DownloadJob::new(spec, Arc::clone(&config))
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .with_remuxer(Arc::new(FfmpegRemuxer::new(script.to_string_lossy())) as Arc<dyn Remuxer>)
        .run()
        .await;

    let JobStatus::Failed(reason) = &report.status else {
        panic!("expected failure, got {report}");
    };
    assert!(reason.contains("Failed to open segment 2"), "{reason}");
    assert!(reason.contains("Invalid data found when processing input"), "{reason}");
    assert!(!config.download_dir.join("e.mp4").exists());
    assert!(!config.download_dir.join("e.part.mp4").exists());
    // 分片留在临时目录供重试复用
    assert!(workspace_dir(&config, "e").join("seg0.ts").exists());
}
