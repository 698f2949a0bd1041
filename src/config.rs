use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use rand::distr::{Alphanumeric, SampleString};

use crate::cli::*;

static CONF_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "", "imcluster")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".imcluster"))
        .to_string_lossy()
        .into_owned()
});

fn default_config_dir() -> &'static str {
    CONF_DIR.as_str()
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct IndexOptions {
    /// 相似度索引服务地址
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:9200")]
    pub index_endpoint: String,
    /// 索引命名空间
    #[arg(long, value_name = "NAME", default_value = "images")]
    pub index_namespace: String,
    /// 判定为近似重复的最大签名距离
    #[arg(long, value_name = "DIST", default_value_t = 0.1, value_parser = parse_threshold)]
    pub distance_threshold: f32,
    /// 查重时使用的距离阈值，0 表示只接受签名完全一致的记录
    #[arg(long, value_name = "DIST", default_value_t = 0.0, value_parser = parse_threshold)]
    pub exact_threshold: f32,
}

impl IndexOptions {
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--index-endpoint".to_string(),
            self.index_endpoint.clone(),
            "--index-namespace".to_string(),
            self.index_namespace.clone(),
            "--distance-threshold".to_string(),
            self.distance_threshold.to_string(),
            "--exact-threshold".to_string(),
            self.exact_threshold.to_string(),
        ]
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct CacheOptions {
    /// memcached 地址，格式为 host:port
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:11211")]
    pub cache_endpoint: String,
}

impl CacheOptions {
    pub fn to_args(&self) -> Vec<String> {
        vec!["--cache-endpoint".to_string(), self.cache_endpoint.clone()]
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// 队列名称
    #[arg(short, long, value_name = "NAME", default_value = "images")]
    pub queue: String,
    /// 队列数据库地址，不填则使用配置目录下的 queue.db
    #[arg(long, value_name = "URL")]
    pub queue_url: Option<String>,
    /// 消息被接收后对其他 worker 不可见的时长，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub visibility_timeout: u64,
}

impl QueueOptions {
    /// 返回队列数据库地址
    pub fn url(&self, conf_dir: &ConfDir) -> String {
        match &self.queue_url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}", conf_dir.queue_database().display()),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout)
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--queue".to_string(),
            self.queue.clone(),
            "--visibility-timeout".to_string(),
            self.visibility_timeout.to_string(),
        ];
        if let Some(url) = &self.queue_url {
            args.push("--queue-url".to_string());
            args.push(url.clone());
        }
        args
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    /// 每次从队列中接收的最大消息数量
    #[arg(short, long, value_name = "N", default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: u32,
    /// 接收消息时的最长等待时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 20)]
    pub wait_time: u64,
    /// 队列为空时的休眠时间，单位为毫秒
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub empty_backoff: u64,
    /// 处理完一批消息后的休眠时间，单位为毫秒
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub busy_backoff: u64,
    /// 单次外部调用的超时时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,
}

impl ConsumerOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--batch-size".to_string(),
            self.batch_size.to_string(),
            "--wait-time".to_string(),
            self.wait_time.to_string(),
            "--empty-backoff".to_string(),
            self.empty_backoff.to_string(),
            "--busy-backoff".to_string(),
            self.busy_backoff.to_string(),
            "--timeout".to_string(),
            self.timeout.to_string(),
        ]
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct MetricsOptions {
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH", value_parser = parse_auth)]
    pub prometheus_auth: Option<(String, String)>,
}

impl MetricsOptions {
    /// instance 标签值，未指定时随机生成
    pub fn instance(&self) -> String {
        self.prometheus_instance
            .clone()
            .unwrap_or_else(|| format!("imcluster-{}", Alphanumeric.sample_string(&mut rand::rng(), 8)))
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![];
        if let Some(url) = &self.prometheus_push {
            args.push("--prometheus-push".to_string());
            args.push(url.clone());
        }
        if let Some(instance) = &self.prometheus_instance {
            args.push("--prometheus-instance".to_string());
            args.push(instance.clone());
        }
        if let Some((username, password)) = &self.prometheus_auth {
            args.push("--prometheus-auth".to_string());
            args.push(format!("{username}:{password}"));
        }
        args
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct SupervisorOptions {
    /// worker 数量，默认为 CPU 核心数
    #[arg(short, long, value_name = "N", default_value_t = num_cpus::get(), value_parser = parse_workers)]
    pub workers: usize,
    /// 检查 worker 存活状态的间隔，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    pub health_check_interval: u64,
    /// worker 的运行方式
    #[arg(long, value_enum, default_value_t = Isolation::Task)]
    pub isolation: Isolation,
}

impl SupervisorOptions {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// 在当前进程内以异步任务运行
    Task,
    /// 每个 worker 一个子进程
    Process,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "imcluster", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// imcluster 配置目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 启动 worker 池并持续消费队列
    Run(RunCommand),
    /// 在当前进程中运行单个 worker
    Worker(WorkerCommand),
    /// 将图片引用写入队列
    Enqueue(EnqueueCommand),
    /// 对单张图片执行一次聚类
    Cluster(ClusterCommand),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回默认队列数据库的路径
    pub fn queue_database(&self) -> PathBuf {
        self.path.join("queue.db")
    }

    /// 确保配置目录存在
    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.path)
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

fn parse_threshold(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|e| format!("无效的距离阈值 {s}: {e}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("距离阈值必须为非负数: {s}"));
    }
    Ok(value)
}

fn parse_workers(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("worker 数量至少为 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(format!("无效的 worker 数量 {s}: {e}")),
    }
}

fn parse_auth(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((username, password)) if !username.is_empty() => {
            Ok((username.to_string(), password.to_string()))
        }
        _ => Err(format!("认证信息格式应为 username:password: {s}")),
    }
}
