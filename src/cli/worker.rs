use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;

use crate::cache::{CacheStore, MemcachedCache};
use crate::cli::SubCommandExtend;
use crate::cluster::{CALLS_PER_MESSAGE, ClusterAssigner, Deduplicator, ImageClusteringPipeline};
use crate::config::*;
use crate::consumer::{ConsumerConfig, QueueConsumer};
use crate::index::{HttpSimilarityIndex, SimilarityIndex};
use crate::metrics;
use crate::queue::{MessageQueue, SqliteQueue};
use crate::utils::with_timeout;

pub type Pipeline = ImageClusteringPipeline<HttpSimilarityIndex, MemcachedCache>;
pub type Consumer = QueueConsumer<SqliteQueue, HttpSimilarityIndex, MemcachedCache>;

/// 单个 worker 需要的全部配置
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub cache: CacheOptions,
    #[command(flatten)]
    pub queue: QueueOptions,
    #[command(flatten)]
    pub consumer: ConsumerOptions,
    #[command(flatten)]
    pub metrics: MetricsOptions,
}

impl WorkerArgs {
    /// 转换回命令行参数，供子进程使用
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.index.to_args();
        args.extend(self.cache.to_args());
        args.extend(self.queue.to_args());
        args.extend(self.consumer.to_args());
        args.extend(self.metrics.to_args());
        args
    }

    /// 租约需要覆盖单条消息的续租、处理与删除
    pub fn check_lease(&self) -> Result<()> {
        let required = self.consumer.timeout() * (CALLS_PER_MESSAGE + 1);
        if self.queue.visibility_timeout() < required {
            bail!(
                "visibility timeout {}s is shorter than the {}s one message may take",
                self.queue.visibility_timeout,
                required.as_secs()
            );
        }
        Ok(())
    }

    /// 打开队列并检查相似度索引和缓存是否可用
    pub async fn connect(&self, id: usize, conf_dir: &ConfDir) -> Result<Consumer> {
        self.check_lease()?;
        let pipeline = connect_pipeline(&self.index, &self.cache, self.consumer.timeout()).await?;
        let queue = connect_queue(&self.queue, conf_dir, self.consumer.timeout()).await?;
        Ok(QueueConsumer::new(id, queue, pipeline, ConsumerConfig::from(&self.consumer)))
    }
}

/// 创建聚类流程，相似度索引或缓存不可用时返回错误
pub async fn connect_pipeline(
    index: &IndexOptions,
    cache: &CacheOptions,
    timeout: Duration,
) -> Result<Pipeline> {
    let client = HttpSimilarityIndex::new(&index.index_endpoint, &index.index_namespace, timeout)?;
    with_timeout(timeout, "检查相似度索引", client.ping())
        .await
        .with_context(|| format!("similarity index unreachable: {}", index.index_endpoint))?;

    let memcached = MemcachedCache::new(&cache.cache_endpoint);
    with_timeout(timeout, "检查缓存", memcached.ping())
        .await
        .with_context(|| format!("cache unreachable: {}", cache.cache_endpoint))?;

    let pipeline = ImageClusteringPipeline::new(
        client,
        memcached,
        Deduplicator::new(index.exact_threshold),
        ClusterAssigner::new(index.distance_threshold),
    );
    Ok(pipeline.with_timeout(timeout))
}

/// 打开队列数据库，不存在时自动创建
pub async fn connect_queue(
    opts: &QueueOptions,
    conf_dir: &ConfDir,
    timeout: Duration,
) -> Result<SqliteQueue> {
    if opts.queue_url.is_none() {
        conf_dir
            .create()
            .with_context(|| format!("failed to create {}", conf_dir.path().display()))?;
    }
    let url = opts.url(conf_dir);
    let queue = SqliteQueue::open(&url, &opts.queue, opts.visibility_timeout()).await?;
    with_timeout(timeout, "检查队列", queue.ping())
        .await
        .with_context(|| format!("queue unreachable: {url}"))?;
    Ok(queue)
}

#[derive(Parser, Debug, Clone)]
pub struct WorkerCommand {
    #[command(flatten)]
    pub worker: WorkerArgs,
    /// worker 编号，用于日志和指标
    #[arg(long, value_name = "ID", default_value_t = 1)]
    pub worker_id: usize,
}

impl SubCommandExtend for WorkerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let consumer = self.worker.connect(self.worker_id, &opts.conf_dir).await?;
        info!("worker {}: 依赖检查通过", self.worker_id);

        let instance = format!("{}-worker-{}", self.worker.metrics.instance(), self.worker_id);
        metrics::spawn_pusher(&self.worker.metrics, instance);

        consumer.run().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_args_round_trip_through_cli() {
        let args = WorkerArgs::parse_from([
            "worker",
            "--index-endpoint",
            "http://10.0.0.1:9200/api",
            "--distance-threshold",
            "0.25",
            "--queue-url",
            "sqlite:///data/q.db",
            "--batch-size",
            "3",
            "--empty-backoff",
            "250",
            "--prometheus-auth",
            "user:pass",
        ]);
        let rebuilt =
            WorkerArgs::parse_from(std::iter::once("worker".to_string()).chain(args.to_args()));
        assert_eq!(rebuilt, args);
        assert_eq!(rebuilt.consumer.batch_size, 3);
        assert_eq!(rebuilt.queue.queue_url.as_deref(), Some("sqlite:///data/q.db"));
    }

    #[test]
    fn lease_must_cover_one_message() {
        assert!(WorkerArgs::parse_from(["worker"]).check_lease().is_ok());
        assert!(WorkerArgs::parse_from(["worker", "--visibility-timeout", "150"]).check_lease().is_ok());

        let short = WorkerArgs::parse_from(["worker", "--visibility-timeout", "149"]);
        assert!(short.check_lease().is_err());
        let slow = WorkerArgs::parse_from(["worker", "--timeout", "120"]);
        assert!(slow.check_lease().is_err());
    }

    #[test]
    fn consumer_config_uses_millisecond_backoffs() {
        let args = WorkerArgs::parse_from(["worker", "--empty-backoff", "1500", "--busy-backoff", "20"]);
        let config = ConsumerConfig::from(&args.consumer);
        assert_eq!(config.empty_backoff, Duration::from_millis(1500));
        assert_eq!(config.busy_backoff, Duration::from_millis(20));
        assert_eq!(config.wait_time, Duration::from_secs(20));
        assert_eq!(config.batch_size, 10);
    }
}
