use clap::Parser;
use std::path::PathBuf;

/// 分段媒体下载器
#[derive(Parser, Debug)]
#[command(name = "mediadl")]
#[command(version = "1.0")]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "并发分块 / HLS 媒体下载工具", long_about = None)]
pub struct Cli {
    /// 下载任务列表 (JSON 数组)
    #[arg(long, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub jobs: PathBuf,

    /// 配置文件 (TOML)
    #[arg(long, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// 视频保存目录
    #[arg(long, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,

    /// 临时文件目录，"auto" 表示 <保存目录>/temp_dir
    #[arg(long, value_name = "DIR")]
    pub temp_dir: Option<String>,

    /// 单个文件的并发数，"auto" 表示 CPU 核数
    #[arg(long, value_name = "N|auto")]
    pub concurrency: Option<String>,

    /// 同时下载的文件数
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// 单次请求超时（秒）
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// 输出调试日志
    #[arg(short, long)]
    pub verbose: bool,
}
