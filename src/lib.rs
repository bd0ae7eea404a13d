pub mod cli;
pub mod common;
pub mod downloader;
pub mod post_process;

pub use downloader::DownloadJob;
pub use downloader::error::DownloadError;
pub use downloader::manager::DownloadManager;
