use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::fetcher::ChunkOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    /// 分块下载按字节计
    Bytes,
    /// HLS 按分片数计
    Segments,
}

impl ProgressUnit {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressUnit::Bytes => "分块",
            ProgressUnit::Segments => "分片",
        }
    }

    fn units_of(&self, bytes: u64) -> u64 {
        match self {
            ProgressUnit::Bytes => bytes,
            ProgressUnit::Segments => 1,
        }
    }

    fn style(&self) -> ProgressStyle {
        let template = match self {
            ProgressUnit::Bytes => {
                "{msg} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({eta}) {prefix}"
            }
            ProgressUnit::Segments => {
                "{msg} [{elapsed_precise}] [{bar:40.green/black}] {pos}/{len} seg ({eta}) {prefix}"
            }
        };
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▒░")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub downloaded: u64,
    pub reused: u64,
    pub reused_count: usize,
    pub failed_count: usize,
}

/// 任务内共享的计数器；只通过 [`JobProgress::record`] 修改
#[derive(Debug)]
pub struct JobProgress {
    unit: ProgressUnit,
    total: u64,
    downloaded: AtomicU64,
    reused: AtomicU64,
    reused_count: AtomicUsize,
    failed_count: AtomicUsize,
    bar: ProgressBar,
}

impl JobProgress {
    pub fn new(total: u64, unit: ProgressUnit, label: &str, multi: Option<&MultiProgress>) -> Self {
        let bar = match multi {
            Some(multi) => multi.add(ProgressBar::new(total)),
            None => ProgressBar::hidden(),
        };
        bar.set_style(unit.style());
        bar.set_message(format!("Downloading {label}"));
        bar.set_prefix("R/F: 0/0");

        Self {
            unit,
            total,
            downloaded: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            reused_count: AtomicUsize::new(0),
            failed_count: AtomicUsize::new(0),
            bar,
        }
    }

    pub fn record(&self, outcome: &ChunkOutcome) {
        match outcome {
            ChunkOutcome::Downloaded { bytes } => {
                let units = self.unit.units_of(*bytes);
                self.downloaded.fetch_add(units, Ordering::Relaxed);
                self.bar.inc(units);
            }
            ChunkOutcome::Reused { bytes } => {
                let units = self.unit.units_of(*bytes);
                self.reused.fetch_add(units, Ordering::Relaxed);
                self.reused_count.fetch_add(1, Ordering::Relaxed);
                self.bar.inc(units);
            }
            ChunkOutcome::Failed { .. } => {
                self.failed_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.bar.set_prefix(format!(
            "R/F: {}/{}",
            self.reused_count.load(Ordering::Relaxed),
            self.failed_count.load(Ordering::Relaxed)
        ));
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            downloaded: self.downloaded.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            reused_count: self.reused_count.load(Ordering::Relaxed),
            failed_count: self.failed_count.load(Ordering::Relaxed),
        }
    }

    pub fn unit(&self) -> ProgressUnit {
        self.unit
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}
